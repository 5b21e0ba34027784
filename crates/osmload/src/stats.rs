use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use axum::{http::StatusCode, response::IntoResponse, routing::get, Router};
use crossbeam_channel::{bounded, select, tick, Sender};
use parking_lot::Mutex;
use prometheus::{Encoder, IntCounter, Registry, TextEncoder};

/// Progress counters shared by every stage of both phases.
///
/// Wrap it in an `Arc` and hand a clone to each worker; all counters are
/// atomic, so any number of workers may add concurrently.
pub struct Statistics {
    pub registry: Registry,
    /// Coordinates written to the cache.
    pub coords: IntCounter,
    /// Tagged nodes written to the cache.
    pub nodes: IntCounter,
    /// Ways written to the cache.
    pub ways: IntCounter,
    /// Relations written to the cache (or counted during export).
    pub relations: IntCounter,
    /// Ways taken from the cache by geometry assembly.
    pub features_seen: IntCounter,
    /// Rows inserted into the destination.
    pub rows_loaded: IntCounter,
    started: Mutex<Instant>,
}

/// Counter values at one instant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub coords: u64,
    pub nodes: u64,
    pub ways: u64,
    pub relations: u64,
    pub features_seen: u64,
    pub rows_loaded: u64,
}

impl Statistics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new_custom(Some("osmload".into()), None)
            .context("creating metrics registry")?;

        macro_rules! reg {
            ($name:expr, $help:expr) => {{
                let collector = IntCounter::new($name, $help)?;
                registry.register(Box::new(collector.clone()))?;
                collector
            }};
        }

        Ok(Self {
            coords: reg!("coords_total", "Coordinates written to the cache"),
            nodes: reg!("nodes_total", "Tagged nodes written to the cache"),
            ways: reg!("ways_total", "Ways written to the cache"),
            relations: reg!("relations_total", "Relations written to the cache"),
            features_seen: reg!("features_seen_total", "Ways read by geometry assembly"),
            rows_loaded: reg!("rows_loaded_total", "Rows inserted into the destination"),
            registry,
            started: Mutex::new(Instant::now()),
        })
    }

    pub fn add_coords(&self, n: usize) {
        self.coords.inc_by(n as u64);
    }

    pub fn add_nodes(&self, n: usize) {
        self.nodes.inc_by(n as u64);
    }

    pub fn add_ways(&self, n: usize) {
        self.ways.inc_by(n as u64);
    }

    pub fn add_relations(&self, n: usize) {
        self.relations.inc_by(n as u64);
    }

    pub fn add_features_seen(&self, n: usize) {
        self.features_seen.inc_by(n as u64);
    }

    pub fn add_rows_loaded(&self, n: usize) {
        self.rows_loaded.inc_by(n as u64);
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            coords: self.coords.get(),
            nodes: self.nodes.get(),
            ways: self.ways.get(),
            relations: self.relations.get(),
            features_seen: self.features_seen.get(),
            rows_loaded: self.rows_loaded.get(),
        }
    }

    /// Zeroes every counter and restarts the clock.
    pub fn reset(&self) {
        self.coords.reset();
        self.nodes.reset();
        self.ways.reset();
        self.relations.reset();
        self.features_seen.reset();
        self.rows_loaded.reset();
        *self.started.lock() = Instant::now();
    }

    pub fn elapsed(&self) -> Duration {
        self.started.lock().elapsed()
    }

    /// Logs a status line with the totals since the last reset.
    pub fn message(&self, msg: &str) {
        let s = self.snapshot();
        log::info!(
            "[{:>8.1}s] {msg}: coords {} nodes {} ways {} relations {} features {} rows {}",
            self.elapsed().as_secs_f64(),
            s.coords,
            s.nodes,
            s.ways,
            s.relations,
            s.features_seen,
            s.rows_loaded,
        );
    }

    /// Text exposition of the registry.
    pub fn encode(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .context("encoding metrics")?;
        String::from_utf8(buffer).context("metrics are not UTF-8")
    }

    /// A router serving the counters on `/metrics`.
    pub fn router(self: &Arc<Self>) -> Router {
        let stats = Arc::clone(self);
        Router::new().route(
            "/metrics",
            get(move || {
                let stats = Arc::clone(&stats);
                async move {
                    match stats.encode() {
                        Ok(body) => body.into_response(),
                        Err(err) => {
                            (StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}")).into_response()
                        }
                    }
                }
            }),
        )
    }
}

fn rate(now: u64, before: u64, secs: f64) -> f64 {
    now.saturating_sub(before) as f64 / secs
}

/// One progress line: totals with per-second rates over the last interval.
pub fn progress_line(before: &Snapshot, now: &Snapshot, interval: Duration) -> String {
    let secs = interval.as_secs_f64().max(1e-9);
    format!(
        "coords {:>11} ({:>9.0}/s)  nodes {:>9} ({:>7.0}/s)  ways {:>9} ({:>7.0}/s)  \
         relations {:>7} ({:>6.0}/s)  features {:>9} ({:>7.0}/s)  rows {:>9} ({:>7.0}/s)",
        now.coords,
        rate(now.coords, before.coords, secs),
        now.nodes,
        rate(now.nodes, before.nodes, secs),
        now.ways,
        rate(now.ways, before.ways, secs),
        now.relations,
        rate(now.relations, before.relations, secs),
        now.features_seen,
        rate(now.features_seen, before.features_seen, secs),
        now.rows_loaded,
        rate(now.rows_loaded, before.rows_loaded, secs),
    )
}

/// Periodically logs progress until stopped or dropped.
pub struct Reporter {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Reporter {
    pub fn start(stats: Arc<Statistics>, interval: Duration) -> Result<Self> {
        let (stop_tx, stop_rx) = bounded::<()>(0);
        let handle = thread::Builder::new()
            .name("stats".into())
            .spawn(move || {
                let ticker = tick(interval);
                let mut last = stats.snapshot();
                let mut last_at = Instant::now();
                loop {
                    select! {
                        recv(ticker) -> _ => {
                            let now = stats.snapshot();
                            if now != last {
                                log::info!("{}", progress_line(&last, &now, last_at.elapsed()));
                            }
                            last = now;
                            last_at = Instant::now();
                        }
                        recv(stop_rx) -> _ => break,
                    }
                }
            })
            .context("spawning stats reporter")?;
        Ok(Self {
            stop: Some(stop_tx),
            handle: Some(handle),
        })
    }

    pub fn stop(&mut self) {
        drop(self.stop.take());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Reporter {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Serves `/metrics` on `addr` from a background thread with its own runtime.
pub fn serve_metrics(stats: &Arc<Statistics>, addr: SocketAddr) -> Result<JoinHandle<()>> {
    let router = stats.router();
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .build()
        .context("building metrics runtime")?;
    let listener = runtime
        .block_on(tokio::net::TcpListener::bind(addr))
        .with_context(|| format!("binding metrics listener on {addr}"))?;
    log::info!("serving metrics on http://{addr}/metrics");

    thread::Builder::new()
        .name("metrics".into())
        .spawn(move || {
            if let Err(err) = runtime.block_on(async move { axum::serve(listener, router).await }) {
                log::error!("metrics server failed: {err}");
            }
        })
        .context("spawning metrics server")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_concurrent_adds_are_all_counted() {
        let stats = Arc::new(Statistics::new().unwrap());
        thread::scope(|s| {
            for _ in 0..8 {
                let stats = &stats;
                s.spawn(move || {
                    for _ in 0..1000 {
                        stats.add_coords(3);
                        stats.add_ways(1);
                    }
                });
            }
        });
        let snap = stats.snapshot();
        assert_eq!(snap.coords, 24_000);
        assert_eq!(snap.ways, 8_000);
        assert_eq!(snap.nodes, 0);
    }

    #[test]
    fn test_reset_zeroes_counters() {
        let stats = Statistics::new().unwrap();
        stats.add_relations(5);
        stats.add_rows_loaded(2);
        stats.reset();
        assert_eq!(stats.snapshot(), Snapshot::default());
    }

    #[test]
    fn test_progress_line_rates() {
        let before = Snapshot {
            coords: 1000,
            ..Default::default()
        };
        let now = Snapshot {
            coords: 3000,
            ways: 10,
            ..Default::default()
        };
        let line = progress_line(&before, &now, Duration::from_secs(2));
        assert!(line.contains("coords        3000 (     1000/s)"), "{line}");
        assert!(line.contains("ways        10 (      5/s)"), "{line}");
    }

    #[test]
    fn test_metrics_exposition() {
        let stats = Statistics::new().unwrap();
        stats.add_nodes(7);
        let text = stats.encode().unwrap();
        assert!(text.contains("osmload_nodes_total 7"), "{text}");
    }

    #[test]
    fn test_reporter_stops_on_drop() {
        let stats = Arc::new(Statistics::new().unwrap());
        let reporter = Reporter::start(Arc::clone(&stats), Duration::from_millis(5)).unwrap();
        stats.add_coords(1);
        thread::sleep(Duration::from_millis(20));
        drop(reporter);
        assert_eq!(Arc::strong_count(&stats), 1);
    }
}
