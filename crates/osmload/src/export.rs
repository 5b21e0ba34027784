//! Export phase: turn cached ways into line geometries and load them.
//!
//! ```text
//!   ways iterator ─► assemble (N) ─► geometry batches ─► load (N) ─► store
//!                        │
//!                        └─► diff cache
//! ```

use std::mem;
use std::slice;
use std::thread;

use anyhow::{Context, Result};
use crossbeam_channel::{bounded, Receiver, Sender};
use osmcache::{CacheIter, CoordsCache, DiffCache, Stores, Way};

use crate::db::{GeometryStore, TableSpec};
use crate::geom::{AssembledWay, GeometryEngine};
use crate::pipeline::WorkerPool;
use crate::proj::Projection;
use crate::stats::Statistics;

/// Assembled ways per batch sent to the loaders.
pub const GEOMETRY_BATCH_SIZE: usize = 10 * 1024;

/// Geometry batches in flight between assembly and load.
pub const GEOMETRY_CHANNEL_CAPACITY: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExportOptions {
    pub workers: usize,
    pub projection: Projection,
}

/// Streams all relations once, counting them.
pub fn count_relations(stores: &Stores, stats: &Statistics) -> Result<u64> {
    let mut n = 0;
    for rel in stores.relations.iter()? {
        rel.context("reading relations from cache")?;
        stats.add_relations(1);
        n += 1;
    }
    Ok(n)
}

/// Fill, record, project and serialize ways until `ways` is exhausted.
///
/// Ways with unresolvable refs are skipped silently; ways whose geometry
/// cannot be built are logged and skipped. The last batch is always sent,
/// even when empty.
pub fn assemble_worker(
    worker: usize,
    ways: CacheIter<Way>,
    coords: &CoordsCache,
    diff: &DiffCache,
    projection: Projection,
    stats: &Statistics,
    out: &Sender<Vec<AssembledWay>>,
) -> Result<()> {
    let mut engine = GeometryEngine::acquire(worker);
    let mut batch = Vec::with_capacity(GEOMETRY_BATCH_SIZE);

    for way in ways {
        let mut way = way.context("reading ways from cache")?;
        stats.add_features_seen(1);

        if !coords
            .fill_way(&mut way)
            .with_context(|| format!("filling way {}", way.id))?
        {
            continue;
        }
        diff.add_way(&way).context("recording diff entries")?;

        let projected = projection.project_all(&way.nodes);
        let wkb = match engine.line_string(&projected) {
            Ok(wkb) => wkb,
            Err(err) => {
                log::warn!("skipping way {}: {:#}", way.id, err);
                continue;
            }
        };
        batch.push(AssembledWay {
            way,
            projected,
            wkb,
        });

        if batch.len() >= GEOMETRY_BATCH_SIZE {
            let full = mem::replace(&mut batch, Vec::with_capacity(GEOMETRY_BATCH_SIZE));
            out.send(full).ok().context("geometry channel closed")?;
        }
    }

    out.send(batch).ok().context("geometry channel closed")?;
    Ok(())
}

/// Inserts every non-empty batch from `rx` into `spec`'s table.
pub fn load_worker(
    rx: Receiver<Vec<AssembledWay>>,
    store: &dyn GeometryStore,
    spec: &TableSpec,
    stats: &Statistics,
) -> Result<()> {
    for batch in rx.iter() {
        if batch.is_empty() {
            continue;
        }
        let n = store
            .insert_ways(&batch, spec)
            .with_context(|| format!("loading {} ways into {}", batch.len(), spec.name))?;
        stats.add_rows_loaded(n);
    }
    Ok(())
}

/// Runs the whole export phase.
///
/// Resets `stats`, counts relations, recreates the diff cache, initializes
/// the destination table, then assembles and loads every cached way.
pub fn run_export(
    stores: &Stores,
    diff: &mut DiffCache,
    store: &dyn GeometryStore,
    spec: &TableSpec,
    stats: &Statistics,
    opts: &ExportOptions,
) -> Result<()> {
    stats.reset();
    let relations = count_relations(stores, stats)?;
    log::info!("{relations} relations in cache");

    diff.remove().context("removing diff cache")?;
    diff.open().context("opening diff cache")?;
    store
        .init(slice::from_ref(spec))
        .context("initializing destination")?;

    let ways = stores.ways.iter()?;
    let coords = &stores.coords;
    let diff_ref: &DiffCache = diff;
    let projection = opts.projection;

    thread::scope(|s| {
        let (tx, rx) = bounded(GEOMETRY_CHANNEL_CAPACITY);

        let loaders = WorkerPool::spawn(s, "load", opts.workers, move |_| {
            load_worker(rx.clone(), store, spec, stats)
        })?;
        let assemblers = {
            let tx = tx.clone();
            WorkerPool::spawn(s, "assemble", opts.workers, move |i| {
                assemble_worker(i, ways.clone(), coords, diff_ref, projection, stats, &tx)
            })?
        };

        let assembled = assemblers.join();
        drop(tx);
        // a failing loader closes the channel, so report it first
        loaders.join()?;
        assembled
    })?;

    diff.flush().context("flushing diff cache")?;
    stats.message("export finished");
    Ok(())
}
