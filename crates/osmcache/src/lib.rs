//! Disk-backed element cache for two-phase OSM imports.
//!
//! Every element kind (coordinates, tagged nodes, ways, relations) lives in
//! its own LMDB environment under `<cachedir>/<kind>/`, keyed by identity in
//! signed order. A separate diff index under `<cachedir>/diff/` maps each
//! coordinate to the ways that use it.
//!
//! Writes are batched: one write transaction per [`ElementStore::put`] call.
//! Reads are either point lookups, [`CoordsCache::fill_way`], or a streaming
//! [`CacheIter`] that several workers can drain together.

pub mod cache;
pub mod codec;
mod coords;
pub mod diff;
pub mod element;
pub mod error;
pub mod store;

pub use cache::{
    CoordsCache, NodesCache, OsmCache, RelationsCache, Stores, WaysCache, DEFAULT_MAP_SIZE,
};
pub use codec::Record;
pub use diff::DiffCache;
pub use element::{tags_from, Coord, Member, MemberKind, Node, Relation, Tags, Way};
pub use error::{CacheError, Result};
pub use store::{readers_for, CacheIter, ElementStore, DEFAULT_MAX_READERS};
