use std::fs;
use std::path::{Path, PathBuf};

use crate::codec::Record;
use crate::element::{Coord, Node, Relation, Way};
use crate::error::{CacheError, Result};
use crate::store::{ElementStore, DEFAULT_MAX_READERS};

/// Default LMDB map size per kind. This is address space, not disk usage.
pub const DEFAULT_MAP_SIZE: usize = 256 << 30;

pub type CoordsCache = ElementStore<Coord>;
pub type NodesCache = ElementStore<Node>;
pub type WaysCache = ElementStore<Way>;
pub type RelationsCache = ElementStore<Relation>;

/// The four open element stores.
pub struct Stores {
    pub coords: CoordsCache,
    pub nodes: NodesCache,
    pub ways: WaysCache,
    pub relations: RelationsCache,
}

/// The element cache rooted at one directory, one LMDB environment per kind
/// under `<dir>/<kind>/`.
pub struct OsmCache {
    dir: PathBuf,
    map_size: usize,
    max_readers: u32,
    stores: Option<Stores>,
}

impl OsmCache {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self::with_map_size(dir, DEFAULT_MAP_SIZE)
    }

    pub fn with_map_size(dir: impl AsRef<Path>, map_size: usize) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            map_size,
            max_readers: DEFAULT_MAX_READERS,
            stores: None,
        }
    }

    /// Reader slots per store; see [`crate::readers_for`].
    pub fn with_max_readers(mut self, max_readers: u32) -> Self {
        self.max_readers = max_readers;
        self
    }

    /// True if any kind already has data on disk.
    pub fn exists(&self) -> bool {
        [Coord::KIND, Node::KIND, Way::KIND, Relation::KIND]
            .iter()
            .any(|kind| self.dir.join(kind).join("data.mdb").exists())
    }

    /// Deletes the stores of every kind. The cache must not be open.
    pub fn remove(&mut self) -> Result<()> {
        self.stores = None;
        for kind in [Coord::KIND, Node::KIND, Way::KIND, Relation::KIND] {
            let path = self.dir.join(kind);
            if path.exists() {
                fs::remove_dir_all(&path)?;
            }
        }
        log::info!("removed element cache at {}", self.dir.display());
        Ok(())
    }

    /// Opens all four stores, creating them if missing. Existing data is kept.
    pub fn open(&mut self) -> Result<()> {
        if self.stores.is_some() {
            return Ok(());
        }
        fs::create_dir_all(&self.dir)?;
        let stores = Stores {
            coords: self.open_kind()?,
            nodes: self.open_kind()?,
            ways: self.open_kind()?,
            relations: self.open_kind()?,
        };
        self.stores = Some(stores);
        log::info!("opened element cache at {}", self.dir.display());
        Ok(())
    }

    fn open_kind<T: Record>(&self) -> Result<ElementStore<T>> {
        ElementStore::open_with_readers(&self.dir.join(T::KIND), self.map_size, self.max_readers)
    }

    pub fn stores(&self) -> Result<&Stores> {
        self.stores.as_ref().ok_or(CacheError::Closed("element"))
    }

    /// Syncs every store to disk and releases it.
    pub fn close(&mut self) -> Result<()> {
        if let Some(stores) = self.stores.take() {
            stores.coords.sync()?;
            stores.nodes.sync()?;
            stores.ways.sync()?;
            stores.relations.sync()?;
            log::debug!("closed element cache at {}", self.dir.display());
        }
        Ok(())
    }
}
