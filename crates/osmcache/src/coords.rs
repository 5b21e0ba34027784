use crate::codec::{id_to_key, Record};
use crate::element::{Coord, Way};
use crate::error::Result;
use crate::store::ElementStore;

impl ElementStore<Coord> {
    /// Resolves every ref of `way` to a coordinate, in ref order.
    ///
    /// All lookups share one read transaction. Returns `false` and leaves
    /// `way.nodes` empty if any ref is missing or the way has no refs.
    /// Calling it again on a filled way recomputes the same result.
    pub fn fill_way(&self, way: &mut Way) -> Result<bool> {
        way.nodes.clear();
        if way.refs.is_empty() {
            return Ok(false);
        }

        let rtxn = self.env().read_txn()?;
        let db = self.db();
        let mut nodes = Vec::with_capacity(way.refs.len());
        for &id in &way.refs {
            match db.get(&rtxn, &id_to_key(id))? {
                Some(bytes) => nodes.push(Coord::decode(id, bytes)?),
                None => return Ok(false),
            }
        }
        way.nodes = nodes;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with(dir: &std::path::Path, coords: &[Coord]) -> ElementStore<Coord> {
        let store = ElementStore::<Coord>::open(dir, 64 << 20).unwrap();
        store.put(coords).unwrap();
        store
    }

    fn c(id: i64, lon: f64, lat: f64) -> Coord {
        Coord { id, lon, lat }
    }

    #[test]
    fn test_fill_resolves_refs_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with(dir.path(), &[c(1, 10.0, 50.0), c(2, 11.0, 51.0), c(3, 12.0, 52.0)]);

        let mut way = Way::new(7, vec![3, 1, 2, 3], Default::default());
        assert!(store.fill_way(&mut way).unwrap());
        let ids: Vec<i64> = way.nodes.iter().map(|n| n.id).collect();
        assert_eq!(ids, vec![3, 1, 2, 3]);
        assert!((way.nodes[1].lat - 50.0).abs() < 1e-7);
        assert!(way.is_filled());
    }

    #[test]
    fn test_fill_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with(dir.path(), &[c(1, 1.0, 1.0), c(2, 2.0, 2.0)]);

        let mut way = Way::new(1, vec![1, 2], Default::default());
        assert!(store.fill_way(&mut way).unwrap());
        let first = way.nodes.clone();
        assert!(store.fill_way(&mut way).unwrap());
        assert_eq!(way.nodes, first);
    }

    #[test]
    fn test_fill_fails_on_missing_ref() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with(dir.path(), &[c(1, 1.0, 1.0), c(2, 2.0, 2.0)]);

        let mut way = Way::new(1, vec![1, 99, 2], Default::default());
        assert!(!store.fill_way(&mut way).unwrap());
        assert!(way.nodes.is_empty());
        assert!(!way.is_filled());
    }

    #[test]
    fn test_failed_fill_clears_previous_nodes() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with(dir.path(), &[c(1, 1.0, 1.0)]);

        let mut way = Way::new(1, vec![1, 2], Default::default());
        way.nodes = vec![c(1, 1.0, 1.0), c(2, 0.0, 0.0)];
        assert!(!store.fill_way(&mut way).unwrap());
        assert!(way.nodes.is_empty());
    }

    #[test]
    fn test_way_without_refs_does_not_fill() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with(dir.path(), &[]);
        let mut way = Way::new(1, Vec::new(), Default::default());
        assert!(!store.fill_way(&mut way).unwrap());
    }
}
