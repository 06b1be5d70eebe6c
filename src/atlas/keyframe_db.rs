//! KeyFrameDatabase — place-recognition index over keyframe BoW vectors.
//!
//! Backed upstream by a visual vocabulary; here the database stores the
//! sparse histograms and answers the two-track query used by place
//! recognition: the best candidates from the querying keyframe's own map
//! (loop candidates) and from every other map (merge candidates).

use std::collections::{HashMap, HashSet};

use super::types::{KeyFrameId, MapId};

/// Sparse Bag-of-Words vector: word id → weight.
pub type BowVector = HashMap<u32, f64>;

/// Similarity between two sparse histograms (dot product).
pub fn bow_score(a: &BowVector, b: &BowVector) -> f64 {
    // Iterate the smaller vector.
    let (small, large) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    small
        .iter()
        .filter_map(|(word, w1)| large.get(word).map(|w2| w1 * w2))
        .sum()
}

/// Place-recognition database.
#[derive(Debug, Default)]
pub struct KeyFrameDatabase {
    entries: HashMap<KeyFrameId, (BowVector, MapId)>,
}

impl KeyFrameDatabase {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Add or refresh a keyframe entry.
    pub fn add(&mut self, kf: KeyFrameId, bow: BowVector, map: MapId) {
        self.entries.insert(kf, (bow, map));
    }

    pub fn erase(&mut self, kf: KeyFrameId) {
        self.entries.remove(&kf);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, kf: KeyFrameId) -> bool {
        self.entries.contains_key(&kf)
    }

    /// Best `n` candidates for loop closure and for map merging.
    ///
    /// Keyframes connected to the query (its covisibility neighborhood) and
    /// the query itself never become candidates. Same-map candidates land
    /// in the loop list, cross-map candidates in the merge list; both are
    /// sorted by decreasing similarity.
    pub fn detect_n_best_candidates(
        &self,
        query_kf: KeyFrameId,
        query_bow: &BowVector,
        query_map: MapId,
        connected: &HashSet<KeyFrameId>,
        n: usize,
    ) -> (Vec<KeyFrameId>, Vec<KeyFrameId>) {
        let mut loop_scored: Vec<(KeyFrameId, f64)> = Vec::new();
        let mut merge_scored: Vec<(KeyFrameId, f64)> = Vec::new();

        for (&kf, (bow, map)) in &self.entries {
            if kf == query_kf || connected.contains(&kf) {
                continue;
            }
            let score = bow_score(query_bow, bow);
            if score <= 0.0 {
                continue;
            }
            if *map == query_map {
                loop_scored.push((kf, score));
            } else {
                merge_scored.push((kf, score));
            }
        }

        let take_best = |mut scored: Vec<(KeyFrameId, f64)>| {
            scored.sort_by(|a, b| {
                b.1.partial_cmp(&a.1)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(a.0.cmp(&b.0))
            });
            scored.truncate(n);
            scored.into_iter().map(|(kf, _)| kf).collect::<Vec<_>>()
        };

        (take_best(loop_scored), take_best(merge_scored))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bow(words: &[(u32, f64)]) -> BowVector {
        words.iter().copied().collect()
    }

    #[test]
    fn test_bow_score_dot_product() {
        let a = bow(&[(1, 0.5), (2, 0.3)]);
        let b = bow(&[(2, 0.4), (3, 0.9)]);
        approx::assert_relative_eq!(bow_score(&a, &b), 0.12, epsilon = 1e-12);
        assert_eq!(bow_score(&a, &bow(&[(7, 1.0)])), 0.0);
    }

    #[test]
    fn test_candidates_split_by_map() {
        let mut db = KeyFrameDatabase::new();
        let query = bow(&[(1, 1.0)]);
        let m0 = MapId::new(0);
        let m1 = MapId::new(1);

        db.add(KeyFrameId::new(1), bow(&[(1, 0.9)]), m0);
        db.add(KeyFrameId::new(2), bow(&[(1, 0.5)]), m0);
        db.add(KeyFrameId::new(3), bow(&[(1, 0.7)]), m1);
        db.add(KeyFrameId::new(4), bow(&[(9, 1.0)]), m1); // no shared words

        let (loops, merges) = db.detect_n_best_candidates(
            KeyFrameId::new(10),
            &query,
            m0,
            &HashSet::new(),
            3,
        );

        assert_eq!(loops, vec![KeyFrameId::new(1), KeyFrameId::new(2)]);
        assert_eq!(merges, vec![KeyFrameId::new(3)]);
    }

    #[test]
    fn test_connected_keyframes_are_excluded() {
        let mut db = KeyFrameDatabase::new();
        let m0 = MapId::new(0);
        db.add(KeyFrameId::new(1), bow(&[(1, 0.9)]), m0);
        db.add(KeyFrameId::new(2), bow(&[(1, 0.8)]), m0);

        let connected: HashSet<_> = [KeyFrameId::new(1)].into_iter().collect();
        let (loops, _) = db.detect_n_best_candidates(
            KeyFrameId::new(10),
            &bow(&[(1, 1.0)]),
            m0,
            &connected,
            3,
        );
        assert_eq!(loops, vec![KeyFrameId::new(2)]);
    }

    #[test]
    fn test_truncates_to_n() {
        let mut db = KeyFrameDatabase::new();
        let m0 = MapId::new(0);
        for i in 0..10 {
            db.add(KeyFrameId::new(i), bow(&[(1, 0.1 * (i + 1) as f64)]), m0);
        }
        let (loops, _) = db.detect_n_best_candidates(
            KeyFrameId::new(99),
            &bow(&[(1, 1.0)]),
            m0,
            &HashSet::new(),
            3,
        );
        assert_eq!(loops.len(), 3);
        assert_eq!(loops[0], KeyFrameId::new(9));
    }
}
