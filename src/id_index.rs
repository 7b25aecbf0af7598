use ahash::AHashMap;

/// Bijection between external 64-bit ids and contiguous 0-based indices.
///
/// Append-only: an id keeps the index it was first assigned, and assigned
/// indices fill `[0, len())` without gaps.
#[derive(Clone, Debug, Default)]
pub struct IdIndex {
    ids: Vec<i64>,
    idx_map: AHashMap<i64, usize>,
}

impl IdIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the index of `id`, assigning the next free one on first sight.
    pub fn get_or_insert(&mut self, id: i64) -> usize {
        if let Some(&idx) = self.idx_map.get(&id) {
            return idx;
        }
        let idx = self.ids.len();
        self.ids.push(id);
        self.idx_map.insert(id, idx);
        idx
    }

    pub fn lookup(&self, id: i64) -> Option<usize> {
        self.idx_map.get(&id).copied()
    }

    pub fn id_of(&self, idx: usize) -> i64 {
        self.ids[idx]
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn ids(&self) -> &[i64] {
        &self.ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assigns_indices_in_insertion_order() {
        let mut index = IdIndex::new();
        assert_eq!(index.get_or_insert(42), 0);
        assert_eq!(index.get_or_insert(-7), 1);
        assert_eq!(index.get_or_insert(1_000_000_007), 2);
        // repeated insertion never reassigns
        assert_eq!(index.get_or_insert(-7), 1);
        assert_eq!(index.len(), 3);
        assert_eq!(index.ids(), &[42, -7, 1_000_000_007]);
    }

    #[test]
    fn lookup_round_trip() {
        let mut index = IdIndex::new();
        for id in [3i64, 5, 2, 8] {
            index.get_or_insert(id);
        }
        for id in [3i64, 5, 2, 8] {
            let idx = index.lookup(id).unwrap();
            assert!(idx < index.len());
            assert_eq!(index.id_of(idx), id);
        }
        assert_eq!(index.lookup(4), None);
    }
}
