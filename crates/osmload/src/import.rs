//! Build phase: decode the source in parallel and persist every element kind.
//!
//! ```text
//!   work items ─► parse (N) ─┬─► coords    ─► persist (N) ─┐
//!                            ├─► nodes     ─► persist (2) ─┤
//!                            ├─► ways      ─► persist (N) ─┼─► element cache
//!                            └─► relations ─► persist (N) ─┘
//! ```

use std::thread;

use anyhow::{Context, Result};
use crossbeam_channel::{bounded, Receiver, Sender};
use osmcache::{Coord, Node, Relation, Stores, Way};
use rayon::prelude::*;

use crate::config::ImportOptions;
use crate::mapping::Mapping;
use crate::pipeline::WorkerPool;
use crate::source::{Block, ElementSource};
use crate::stats::Statistics;

/// Batches in flight per element kind.
pub const CHANNEL_CAPACITY: usize = 64;

/// Tagged nodes are rare next to coordinates; two writers keep up.
pub const NODE_WORKERS: usize = 2;

/// The producing ends of the four element channels.
pub struct Senders {
    pub coords: Sender<Vec<Coord>>,
    pub nodes: Sender<Vec<Node>>,
    pub ways: Sender<Vec<Way>>,
    pub relations: Sender<Vec<Relation>>,
}

impl Senders {
    /// Sends one batch per non-empty kind.
    pub fn send_block(&self, block: Block) -> Result<()> {
        if !block.coords.is_empty() {
            self.coords
                .send(block.coords)
                .ok()
                .context("coords channel closed")?;
        }
        if !block.nodes.is_empty() {
            self.nodes
                .send(block.nodes)
                .ok()
                .context("nodes channel closed")?;
        }
        if !block.ways.is_empty() {
            self.ways.send(block.ways).ok().context("ways channel closed")?;
        }
        if !block.relations.is_empty() {
            self.relations
                .send(block.relations)
                .ok()
                .context("relations channel closed")?;
        }
        Ok(())
    }
}

/// Decodes every work item of `source` on a dedicated pool of `workers`
/// threads and fans the elements out to `tx`.
///
/// Returns once every parse thread has stopped; the caller closes the
/// channels by dropping `tx` afterwards.
pub fn parse_stage(source: &dyn ElementSource, workers: usize, tx: &Senders) -> Result<()> {
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers.max(1))
        .thread_name(|i| format!("parse-{i}"))
        .build()
        .context("building parse pool")?;

    pool.install(|| {
        source.work_items().par_bridge().try_for_each(|item| {
            let item = item.context("scanning source")?;
            let block = source
                .decode(&item)
                .with_context(|| format!("decoding {} block at offset {}", item.kind, item.offset))?;
            tx.send_block(block)
        })
    })
}

fn persist_coords(
    rx: Receiver<Vec<Coord>>,
    stores: &Stores,
    stats: &Statistics,
    opts: &ImportOptions,
) -> Result<()> {
    for batch in rx.iter() {
        if opts.skip_coords {
            continue;
        }
        let n = stores.coords.put(&batch).context("writing coords")?;
        stats.add_coords(n);
    }
    Ok(())
}

fn persist_nodes(
    rx: Receiver<Vec<Node>>,
    stores: &Stores,
    stats: &Statistics,
    mapping: &Mapping,
    opts: &ImportOptions,
) -> Result<()> {
    for mut batch in rx.iter() {
        if opts.skip_nodes {
            continue;
        }
        for node in &mut batch {
            if !mapping.points.filter(&mut node.tags) {
                node.tags.clear();
            }
        }
        let n = stores.nodes.put(&batch).context("writing nodes")?;
        stats.add_nodes(n);
    }
    Ok(())
}

fn persist_ways(
    rx: Receiver<Vec<Way>>,
    stores: &Stores,
    stats: &Statistics,
    mapping: &Mapping,
    opts: &ImportOptions,
) -> Result<()> {
    for mut batch in rx.iter() {
        if opts.skip_ways {
            continue;
        }
        for way in &mut batch {
            mapping.ways.filter(&mut way.tags);
        }
        let n = stores.ways.put(&batch).context("writing ways")?;
        stats.add_ways(n);
    }
    Ok(())
}

fn persist_relations(
    rx: Receiver<Vec<Relation>>,
    stores: &Stores,
    stats: &Statistics,
    mapping: &Mapping,
) -> Result<()> {
    for mut batch in rx.iter() {
        for rel in &mut batch {
            mapping.relations.filter(&mut rel.tags);
        }
        let n = stores.relations.put(&batch).context("writing relations")?;
        stats.add_relations(n);
    }
    Ok(())
}

/// Runs the whole build phase and returns when every element is persisted.
pub fn run_import(
    source: &dyn ElementSource,
    stores: &Stores,
    stats: &Statistics,
    mapping: &Mapping,
    opts: &ImportOptions,
) -> Result<()> {
    thread::scope(|s| {
        let (coords_tx, coords_rx) = bounded(CHANNEL_CAPACITY);
        let (nodes_tx, nodes_rx) = bounded(CHANNEL_CAPACITY);
        let (ways_tx, ways_rx) = bounded(CHANNEL_CAPACITY);
        let (relations_tx, relations_rx) = bounded(CHANNEL_CAPACITY);
        let tx = Senders {
            coords: coords_tx,
            nodes: nodes_tx,
            ways: ways_tx,
            relations: relations_tx,
        };

        let coords = WorkerPool::spawn(s, "coords", opts.workers, move |_| {
            persist_coords(coords_rx.clone(), stores, stats, opts)
        })?;
        let nodes = WorkerPool::spawn(s, "nodes", NODE_WORKERS, move |_| {
            persist_nodes(nodes_rx.clone(), stores, stats, mapping, opts)
        })?;
        let ways = WorkerPool::spawn(s, "ways", opts.workers, move |_| {
            persist_ways(ways_rx.clone(), stores, stats, mapping, opts)
        })?;
        let relations = WorkerPool::spawn(s, "relations", opts.workers, move |_| {
            persist_relations(relations_rx.clone(), stores, stats, mapping)
        })?;

        let parsed = parse_stage(source, opts.workers, &tx);
        drop(tx);

        // a persistence failure usually is the reason parsing hit a closed channel
        coords.join()?;
        nodes.join()?;
        ways.join()?;
        relations.join()?;
        parsed
    })
}
