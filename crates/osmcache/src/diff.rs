use std::fs;
use std::mem;
use std::path::{Path, PathBuf};

use heed3::byteorder::BE;
use heed3::types::U64;
use heed3::{Database, DatabaseFlags, Env};
use parking_lot::Mutex;

use crate::codec::{id_to_key, key_to_id};
use crate::element::Way;
use crate::error::{CacheError, Result};
use crate::store::{open_env, DEFAULT_MAX_READERS};

/// Pending entries that trigger a write transaction.
pub const DIFF_FLUSH_THRESHOLD: usize = 64 * 1024;

const DB_DIFF: &str = "diff";

type DiffDb = Database<U64<BE>, U64<BE>>;

/// Index from coordinate identity to the identities of every way using it.
///
/// Each coordinate key holds a sorted set of way ids (`DUP_SORT | DUP_FIXED`),
/// so adding the same pair twice is a no-op.
pub struct DiffCache {
    dir: PathBuf,
    map_size: usize,
    max_readers: u32,
    open: Option<(Env, DiffDb)>,
    pending: Mutex<Vec<(u64, u64)>>,
}

impl DiffCache {
    pub fn new(dir: impl AsRef<Path>, map_size: usize) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            map_size,
            max_readers: DEFAULT_MAX_READERS,
            open: None,
            pending: Mutex::new(Vec::new()),
        }
    }

    pub fn with_max_readers(mut self, max_readers: u32) -> Self {
        self.max_readers = max_readers;
        self
    }

    /// Deletes the on-disk index. Buffered entries are discarded.
    pub fn remove(&mut self) -> Result<()> {
        self.open = None;
        self.pending.lock().clear();
        if self.dir.exists() {
            fs::remove_dir_all(&self.dir)?;
            log::debug!("removed diff cache at {}", self.dir.display());
        }
        Ok(())
    }

    pub fn open(&mut self) -> Result<()> {
        let env = open_env(&self.dir, self.map_size, self.max_readers)?;
        let mut wtxn = env.write_txn()?;
        let db: DiffDb = env
            .database_options()
            .types::<U64<BE>, U64<BE>>()
            .flags(DatabaseFlags::DUP_SORT | DatabaseFlags::DUP_FIXED)
            .name(DB_DIFF)
            .create(&mut wtxn)?;
        wtxn.commit()?;
        self.open = Some((env, db));
        Ok(())
    }

    /// Records that `way_id` uses `coord_id`.
    pub fn add(&self, coord_id: i64, way_id: i64) -> Result<()> {
        self.ensure_open()?;
        let full = {
            let mut pending = self.pending.lock();
            pending.push((id_to_key(coord_id), id_to_key(way_id)));
            take_if_full(&mut pending)
        };
        match full {
            Some(batch) => self.write(batch),
            None => Ok(()),
        }
    }

    /// Records every ref of `way` at once.
    pub fn add_way(&self, way: &Way) -> Result<()> {
        self.ensure_open()?;
        let way_key = id_to_key(way.id);
        let full = {
            let mut pending = self.pending.lock();
            pending.extend(way.refs.iter().map(|&r| (id_to_key(r), way_key)));
            take_if_full(&mut pending)
        };
        match full {
            Some(batch) => self.write(batch),
            None => Ok(()),
        }
    }

    /// Commits buffered entries and syncs the environment to disk.
    pub fn flush(&self) -> Result<()> {
        let batch = mem::take(&mut *self.pending.lock());
        if !batch.is_empty() {
            self.write(batch)?;
        }
        if let Some((env, _)) = &self.open {
            env.force_sync()?;
        }
        Ok(())
    }

    pub fn close(&mut self) -> Result<()> {
        if self.open.is_some() {
            self.flush()?;
            self.open = None;
        }
        Ok(())
    }

    /// Way ids recorded for `coord_id`, ascending. Unflushed entries are not visible.
    pub fn ways_for(&self, coord_id: i64) -> Result<Vec<i64>> {
        let (env, db) = self.open.as_ref().ok_or(CacheError::Closed(DB_DIFF))?;
        let rtxn = env.read_txn()?;
        let mut ways = Vec::new();
        if let Some(dups) = db.get_duplicates(&rtxn, &id_to_key(coord_id))? {
            for entry in dups {
                let (_, way) = entry?;
                ways.push(key_to_id(way));
            }
        }
        Ok(ways)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.open.is_none() {
            return Err(CacheError::Closed(DB_DIFF));
        }
        Ok(())
    }

    fn write(&self, mut batch: Vec<(u64, u64)>) -> Result<()> {
        let (env, db) = self.open.as_ref().ok_or(CacheError::Closed(DB_DIFF))?;
        batch.sort_unstable();
        batch.dedup();
        let mut wtxn = env.write_txn()?;
        for (coord, way) in &batch {
            db.put(&mut wtxn, coord, way)?;
        }
        wtxn.commit()?;
        log::trace!("diff cache: wrote {} entries", batch.len());
        Ok(())
    }
}

fn take_if_full(pending: &mut Vec<(u64, u64)>) -> Option<Vec<(u64, u64)>> {
    if pending.len() >= DIFF_FLUSH_THRESHOLD {
        Some(mem::take(pending))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opened(dir: &Path) -> DiffCache {
        let mut diff = DiffCache::new(dir.join("diff"), 64 << 20);
        diff.remove().unwrap();
        diff.open().unwrap();
        diff
    }

    #[test]
    fn test_accumulates_ways_per_coord() {
        let dir = tempfile::tempdir().unwrap();
        let diff = opened(dir.path());
        diff.add_way(&Way::new(20, vec![1, 2, 3], Default::default()))
            .unwrap();
        diff.add_way(&Way::new(-4, vec![3, 4], Default::default()))
            .unwrap();
        diff.add(3, 20).unwrap();
        diff.flush().unwrap();

        assert_eq!(diff.ways_for(3).unwrap(), vec![-4, 20]);
        assert_eq!(diff.ways_for(1).unwrap(), vec![20]);
        assert!(diff.ways_for(99).unwrap().is_empty());
    }

    #[test]
    fn test_threshold_writes_without_flush() {
        let dir = tempfile::tempdir().unwrap();
        let diff = opened(dir.path());
        for coord in 0..DIFF_FLUSH_THRESHOLD as i64 {
            diff.add(coord, 7).unwrap();
        }
        assert!(diff.pending.lock().is_empty());
        assert_eq!(diff.ways_for(0).unwrap(), vec![7]);
    }

    #[test]
    fn test_close_persists_and_remove_clears() {
        let dir = tempfile::tempdir().unwrap();
        let mut diff = opened(dir.path());
        diff.add(5, 6).unwrap();
        diff.close().unwrap();
        assert!(matches!(diff.add(5, 7), Err(CacheError::Closed(_))));

        diff.open().unwrap();
        assert_eq!(diff.ways_for(5).unwrap(), vec![6]);

        diff.remove().unwrap();
        assert!(!diff.dir.exists());
        diff.open().unwrap();
        assert!(diff.ways_for(5).unwrap().is_empty());
    }
}
