//! Entry point for the osmload command line tool.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use osmcache::{DiffCache, OsmCache, Stores};
use osmload::config::{CacheMode, Config};
use osmload::export::{run_export, ExportOptions};
use osmload::import::run_import;
use osmload::mapping::Mapping;
use osmload::source::PbfSource;
use osmload::stats::{serve_metrics, Reporter, Statistics};

fn main() {
    // Initialize logging; default to "info" if RUST_LOG is unset.
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Config::parse();
    if let Err(err) = run(&config) {
        log::error!("{err:#}");
        log::logger().flush();
        std::process::exit(1);
    }
}

fn run(config: &Config) -> Result<()> {
    // Fail on bad export settings before spending hours on the build phase.
    let export = if config.write {
        Some((config.projection()?, config.db_config()?))
    } else {
        None
    };

    let profile = config.cpuprofile.as_deref().map(CpuProfile::start).transpose()?;

    let mut cache = OsmCache::with_map_size(&config.cachedir, config.map_size())
        .with_max_readers(config.max_readers());
    match config.cache_mode(cache.exists())? {
        CacheMode::Overwrite => {
            info!("removing existing cache {}", config.cachedir.display());
            cache.remove().context("unable to remove cache")?;
        }
        CacheMode::Append => info!("appending to cache {}", config.cachedir.display()),
        CacheMode::Fresh | CacheMode::Existing => {}
    }
    cache.open().context("opening cache")?;

    let stats = Arc::new(Statistics::new()?);
    let _metrics = config
        .metrics_addr
        .map(|addr| serve_metrics(&stats, addr))
        .transpose()?;
    let mut reporter = Reporter::start(Arc::clone(&stats), config.report_interval())?;

    let result = cache
        .stores()
        .map_err(anyhow::Error::from)
        .and_then(|stores| phases(config, stores, &stats, export));

    reporter.stop();
    let closed = cache.close().context("closing cache");
    let profiled = profile.map_or(Ok(()), CpuProfile::finish);
    settle(result, closed, profiled)
}

/// Reports the phase error first, then cache shutdown, then profiling.
fn settle(phases: Result<()>, closed: Result<()>, profiled: Result<()>) -> Result<()> {
    phases.and(closed).and(profiled)
}

fn phases(
    config: &Config,
    stores: &Stores,
    stats: &Statistics,
    export: Option<(osmload::proj::Projection, osmload::db::DbConfig)>,
) -> Result<()> {
    if let Some(pbf) = &config.read {
        let source = PbfSource::open(pbf)?;
        info!("reading {}", source.path().display());
        run_import(
            &source,
            stores,
            stats,
            &Mapping::default(),
            &config.import_options(),
        )
        .with_context(|| format!("reading {}", pbf.display()))?;
        stats.message("done reading");
    }

    if let Some((projection, db)) = export {
        let spec = config.table_spec(&db);
        let store = osmload::db::open(&db)?;
        let mut diff = DiffCache::new(config.cachedir.join("diff"), config.map_size())
            .with_max_readers(config.max_readers());
        let opts = ExportOptions {
            workers: config.workers,
            projection,
        };
        run_export(stores, &mut diff, store.as_ref(), &spec, stats, &opts)
            .with_context(|| format!("writing {}.{}", spec.schema, spec.name))?;
        diff.close().context("closing diff cache")?;
    }
    Ok(())
}

/// Samples the process while alive and writes a flamegraph on `finish`.
struct CpuProfile {
    guard: pprof::ProfilerGuard<'static>,
    path: PathBuf,
}

impl CpuProfile {
    fn start(path: &Path) -> Result<Self> {
        let guard = pprof::ProfilerGuardBuilder::default()
            .frequency(1000)
            .blocklist(&["libc", "libgcc", "pthread", "vdso"])
            .build()
            .context("starting CPU profiler")?;
        info!("profiling CPU to {}", path.display());
        Ok(Self {
            guard,
            path: path.to_path_buf(),
        })
    }

    fn finish(self) -> Result<()> {
        let report = self
            .guard
            .report()
            .build()
            .context("building CPU profile")?;
        let file = File::create(&self.path)
            .with_context(|| format!("creating {}", self.path.display()))?;
        report
            .flamegraph(file)
            .context("writing flamegraph")?;
        info!("wrote CPU profile to {}", self.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_error_wins_over_profiler_error() {
        let err = settle(
            Err(anyhow::anyhow!("reading planet.pbf")),
            Ok(()),
            Err(anyhow::anyhow!("writing flamegraph")),
        )
        .unwrap_err();
        assert_eq!(err.to_string(), "reading planet.pbf");

        let err = settle(Ok(()), Ok(()), Err(anyhow::anyhow!("writing flamegraph"))).unwrap_err();
        assert_eq!(err.to_string(), "writing flamegraph");
        assert!(settle(Ok(()), Ok(()), Ok(())).is_ok());
    }
}
