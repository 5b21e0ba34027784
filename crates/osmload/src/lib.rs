//! Two-phase OSM import.
//!
//! The build phase ([`import`]) decodes a PBF extract on a pool of parse
//! threads and persists coordinates, tagged nodes, ways and relations into an
//! [`osmcache::OsmCache`]. The export phase ([`export`]) streams the cached
//! ways, resolves their coordinates, projects them, serializes them as WKB and
//! bulk-loads them into a [`db::GeometryStore`].

pub mod config;
pub mod db;
pub mod export;
pub mod geom;
pub mod import;
pub mod mapping;
pub mod pipeline;
pub mod proj;
pub mod source;
pub mod stats;
