use std::fs;
use std::marker::PhantomData;
use std::path::Path;
use std::thread;

use crossbeam_channel::{bounded, Receiver, Sender};
use heed3::byteorder::BE;
use heed3::types::{Bytes, U64};
use heed3::{Database, Env, EnvFlags, EnvOpenOptions};

use crate::codec::{id_to_key, key_to_id, Record};
use crate::error::Result;

/// Records buffered between the reader thread and the consumers of one iteration.
const ITER_BUFFER: usize = 4096;

/// Reader slots of an environment opened without an explicit limit.
pub const DEFAULT_MAX_READERS: u32 = 256;

/// Slots kept free for iterator threads and one-off reads.
const READER_HEADROOM: u32 = 64;

pub(crate) type ElementDb = Database<U64<BE>, Bytes>;

/// Reader slots needed when `workers` threads read one environment at once.
///
/// LMDB binds a reader slot to each thread that has opened a read
/// transaction, so the limit must grow with the worker count.
pub fn readers_for(workers: usize) -> u32 {
    u32::try_from(workers)
        .unwrap_or(u32::MAX)
        .saturating_add(READER_HEADROOM)
        .max(DEFAULT_MAX_READERS)
}

/// Opens (or creates) an LMDB environment for bulk import.
///
/// Syncing is deferred to [`Env::force_sync`], which every owner calls on close.
pub(crate) fn open_env(dir: &Path, map_size: usize, max_readers: u32) -> Result<Env> {
    fs::create_dir_all(dir)?;
    let env = unsafe {
        EnvOpenOptions::new()
            .map_size(map_size)
            .max_dbs(1)
            .max_readers(max_readers)
            .flags(EnvFlags::NO_SYNC | EnvFlags::NO_META_SYNC)
            .open(dir)?
    };
    Ok(env)
}

/// A disk-backed table of one element kind, keyed by identity.
pub struct ElementStore<T: Record> {
    env: Env,
    db: ElementDb,
    _kind: PhantomData<fn() -> T>,
}

impl<T: Record> ElementStore<T> {
    pub fn open(dir: &Path, map_size: usize) -> Result<Self> {
        Self::open_with_readers(dir, map_size, DEFAULT_MAX_READERS)
    }

    pub fn open_with_readers(dir: &Path, map_size: usize, max_readers: u32) -> Result<Self> {
        let env = open_env(dir, map_size, max_readers)?;
        let mut wtxn = env.write_txn()?;
        let db: ElementDb = env.create_database(&mut wtxn, Some(T::KIND))?;
        wtxn.commit()?;
        log::debug!("opened {} cache at {}", T::KIND, dir.display());
        Ok(Self {
            env,
            db,
            _kind: PhantomData,
        })
    }

    /// Writes a batch in a single transaction. A later write of the same
    /// identity replaces the earlier one.
    pub fn put(&self, records: &[T]) -> Result<usize> {
        let mut wtxn = self.env.write_txn()?;
        let mut buf = Vec::with_capacity(64);
        for record in records {
            buf.clear();
            record.encode(&mut buf);
            self.db
                .put(&mut wtxn, &id_to_key(record.id()), buf.as_slice())?;
        }
        wtxn.commit()?;
        Ok(records.len())
    }

    pub fn get(&self, id: i64) -> Result<Option<T>> {
        let rtxn = self.env.read_txn()?;
        match self.db.get(&rtxn, &id_to_key(id))? {
            Some(bytes) => Ok(Some(T::decode(id, bytes)?)),
            None => Ok(None),
        }
    }

    pub fn len(&self) -> Result<u64> {
        let rtxn = self.env.read_txn()?;
        Ok(self.db.len(&rtxn)?)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Streams every record in ascending identity order.
    ///
    /// A dedicated thread holds one read transaction for the lifetime of the
    /// iteration, so the stream is a consistent snapshot. The returned
    /// [`CacheIter`] can be cloned to let several workers drain the same
    /// stream; each record is delivered to exactly one of them. Dropping every
    /// clone stops the reader.
    pub fn iter(&self) -> Result<CacheIter<T>> {
        let (tx, rx) = bounded(ITER_BUFFER);
        let env = self.env.clone();
        let db = self.db;
        thread::Builder::new()
            .name(format!("{}-iter", T::KIND))
            .spawn(move || {
                if let Err(e) = stream(&env, db, &tx) {
                    let _ = tx.send(Err(e));
                }
            })?;
        Ok(CacheIter { rx })
    }

    pub fn sync(&self) -> Result<()> {
        self.env.force_sync()?;
        Ok(())
    }

    pub(crate) fn env(&self) -> &Env {
        &self.env
    }

    pub(crate) fn db(&self) -> ElementDb {
        self.db
    }
}

fn stream<T: Record>(env: &Env, db: ElementDb, tx: &Sender<Result<T>>) -> Result<()> {
    let rtxn = env.read_txn()?;
    for entry in db.iter(&rtxn)? {
        let (key, bytes) = entry?;
        let record = T::decode(key_to_id(key), bytes)?;
        if tx.send(Ok(record)).is_err() {
            log::trace!("{} iteration abandoned by all consumers", T::KIND);
            break;
        }
    }
    Ok(())
}

/// A shareable, finite stream over one cache kind.
pub struct CacheIter<T> {
    rx: Receiver<Result<T>>,
}

impl<T> Clone for CacheIter<T> {
    fn clone(&self) -> Self {
        Self {
            rx: self.rx.clone(),
        }
    }
}

impl<T> Iterator for CacheIter<T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        self.rx.recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::{tags_from, Node, Way};
    use std::collections::HashSet;

    const MAP: usize = 64 << 20;

    #[test]
    fn test_put_then_get() {
        let dir = tempfile::tempdir().unwrap();
        let store = ElementStore::<Node>::open(dir.path(), MAP).unwrap();
        let node = Node {
            id: -12,
            lon: 8.5,
            lat: 47.25,
            tags: tags_from([("amenity", "bench")]),
        };
        assert_eq!(store.put(&[node.clone()]).unwrap(), 1);
        assert_eq!(store.get(-12).unwrap(), Some(node));
        assert_eq!(store.get(12).unwrap(), None);
    }

    #[test]
    fn test_readers_grow_with_workers() {
        assert_eq!(readers_for(1), DEFAULT_MAX_READERS);
        assert_eq!(readers_for(300), 364);
        assert_eq!(readers_for(usize::MAX), u32::MAX);
    }

    #[test]
    fn test_more_concurrent_readers_than_default_slots() {
        let dir = tempfile::tempdir().unwrap();
        let workers = DEFAULT_MAX_READERS as usize + 44;
        let store =
            ElementStore::<Way>::open_with_readers(dir.path(), MAP, readers_for(workers)).unwrap();
        store.put(&[Way::new(1, vec![1, 2], Default::default())]).unwrap();

        // every thread keeps its reader slot until it exits
        let barrier = std::sync::Barrier::new(workers);
        thread::scope(|s| {
            for _ in 0..workers {
                let (store, barrier) = (&store, &barrier);
                s.spawn(move || {
                    let found = store.get(1).map(|w| w.is_some());
                    barrier.wait();
                    assert!(matches!(found, Ok(true)), "{found:?}");
                });
            }
        });
    }

    #[test]
    fn test_last_write_wins() {
        let dir = tempfile::tempdir().unwrap();
        let store = ElementStore::<Way>::open(dir.path(), MAP).unwrap();
        store.put(&[Way::new(5, vec![1, 2], Default::default())]).unwrap();
        store.put(&[Way::new(5, vec![3, 4, 5], Default::default())]).unwrap();
        assert_eq!(store.len().unwrap(), 1);
        assert_eq!(store.get(5).unwrap().unwrap().refs, vec![3, 4, 5]);
    }

    #[test]
    fn test_iter_yields_each_identity_once_ascending() {
        let dir = tempfile::tempdir().unwrap();
        let store = ElementStore::<Way>::open(dir.path(), MAP).unwrap();
        let ids = [40, -7, 3, 0, -100, 3, 12];
        let ways: Vec<Way> = ids
            .iter()
            .map(|&id| Way::new(id, vec![id, id + 1], Default::default()))
            .collect();
        store.put(&ways[..4]).unwrap();
        store.put(&ways[4..]).unwrap();

        let seen: Vec<i64> = store.iter().unwrap().map(|w| w.unwrap().id).collect();
        assert_eq!(seen, vec![-100, -7, 0, 3, 12, 40]);
    }

    #[test]
    fn test_iter_fans_out_across_clones() {
        let dir = tempfile::tempdir().unwrap();
        let store = ElementStore::<Way>::open(dir.path(), MAP).unwrap();
        let ways: Vec<Way> = (0..10_000)
            .map(|id| Way::new(id, vec![id], Default::default()))
            .collect();
        store.put(&ways).unwrap();

        let iter = store.iter().unwrap();
        let seen: Vec<Vec<i64>> = thread::scope(|s| {
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    let it = iter.clone();
                    s.spawn(move || it.map(|w| w.unwrap().id).collect::<Vec<_>>())
                })
                .collect();
            drop(iter);
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let total: usize = seen.iter().map(Vec::len).sum();
        let distinct: HashSet<i64> = seen.into_iter().flatten().collect();
        assert_eq!(total, 10_000);
        assert_eq!(distinct.len(), 10_000);
    }

    #[test]
    fn test_dropping_iterator_early_is_fine() {
        let dir = tempfile::tempdir().unwrap();
        let store = ElementStore::<Way>::open(dir.path(), MAP).unwrap();
        let ways: Vec<Way> = (0..20_000)
            .map(|id| Way::new(id, vec![id], Default::default()))
            .collect();
        store.put(&ways).unwrap();

        let first: Vec<i64> = store.iter().unwrap().take(3).map(|w| w.unwrap().id).collect();
        assert_eq!(first, vec![0, 1, 2]);
        // the store stays usable for writes while a stopped reader winds down
        store.put(&[Way::new(-1, vec![1], Default::default())]).unwrap();
        assert_eq!(store.len().unwrap(), 20_001);
    }
}
