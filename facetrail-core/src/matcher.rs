use crate::embed::Embedding;
use crate::store::IdentityStore;
use serde::Serialize;

/// Label for faces that match no enrolled identity
pub const UNKNOWN: &str = "Unknown";

/// Closest enrolled identity for one query embedding
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchResult {
    /// Enrolled name, or [`UNKNOWN`]
    pub name: String,
    /// Smallest L2 distance seen, even when above threshold
    pub distance: f32,
}

impl MatchResult {
    pub fn unknown(distance: f32) -> Self {
        Self {
            name: UNKNOWN.to_string(),
            distance,
        }
    }

    pub fn is_known(&self) -> bool {
        self.name != UNKNOWN
    }
}

/// Euclidean distance between two embeddings of equal length
pub fn euclidean_distance(a: &Embedding, b: &Embedding) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}

/// Find the enrolled identity nearest to `query`.
///
/// Each identity scores its closest reference embedding; the globally closest
/// identity wins and is then accepted only if its distance is strictly below
/// `threshold`. Equal distances keep the name that iterates first.
pub fn find_best_match(query: &Embedding, store: &IdentityStore, threshold: f32) -> MatchResult {
    if store.is_empty() {
        return MatchResult::unknown(f32::INFINITY);
    }

    let mut best: Option<(&str, f32)> = None;
    for (name, references) in store.iter() {
        let Some(distance) = min_distance(query, references) else {
            continue;
        };
        if best.map_or(true, |(_, best_distance)| distance < best_distance) {
            best = Some((name, distance));
        }
    }

    match best {
        Some((name, distance)) if distance < threshold => MatchResult {
            name: name.to_string(),
            distance,
        },
        Some((_, distance)) => MatchResult::unknown(distance),
        None => MatchResult::unknown(f32::INFINITY),
    }
}

/// Closest reference for one identity; references of another length are skipped
fn min_distance(query: &Embedding, references: &[Embedding]) -> Option<f32> {
    let mut min: Option<f32> = None;
    for reference in references {
        if reference.len() != query.len() {
            log::warn!(
                "Skipping {}-dimensional reference for {}-dimensional query",
                reference.len(),
                query.len()
            );
            continue;
        }
        let distance = euclidean_distance(query, reference);
        if min.map_or(true, |m| distance < m) {
            min = Some(distance);
        }
    }
    min
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr1;

    fn store_with(entries: &[(&str, &[f32])]) -> IdentityStore {
        let mut store = IdentityStore::new();
        for (name, values) in entries {
            store.append(name, arr1(values)).unwrap();
        }
        store
    }

    #[test]
    fn test_euclidean_distance() {
        let a = arr1(&[0.0, 0.0]);
        let b = arr1(&[3.0, 4.0]);
        assert!((euclidean_distance(&a, &b) - 5.0).abs() < 1e-6);
        assert_eq!(euclidean_distance(&a, &b), euclidean_distance(&b, &a));
    }

    #[test]
    fn test_empty_store_is_unknown_at_infinity() {
        let result = find_best_match(&arr1(&[1.0, 2.0]), &IdentityStore::new(), 0.6);
        assert_eq!(result.name, UNKNOWN);
        assert!(result.distance.is_infinite());
        assert!(!result.is_known());
    }

    #[test]
    fn test_uses_closest_reference_per_identity() {
        // Alice has one far and one near reference; Bob sits in between
        let store = store_with(&[
            ("Alice", &[10.0, 10.0]),
            ("Alice", &[1.0, 0.1]),
            ("Bob", &[1.5, 0.0]),
        ]);

        let result = find_best_match(&arr1(&[1.0, 0.0]), &store, 0.6);
        assert_eq!(result.name, "Alice");
        assert!((result.distance - 0.1).abs() < 1e-5);
    }

    #[test]
    fn test_threshold_is_strict() {
        let store = store_with(&[("Alice", &[0.0, 0.0])]);

        let at = find_best_match(&arr1(&[0.6, 0.0]), &store, 0.6);
        assert_eq!(at.name, UNKNOWN);
        assert!((at.distance - 0.6).abs() < 1e-6);

        let below = find_best_match(&arr1(&[0.59, 0.0]), &store, 0.6);
        assert_eq!(below.name, "Alice");
    }

    #[test]
    fn test_global_minimum_decides_before_threshold() {
        // Best identity above threshold stays Unknown
        let store = store_with(&[("Alice", &[2.0, 0.0]), ("Bob", &[0.0, 3.0])]);
        let result = find_best_match(&arr1(&[0.0, 0.0]), &store, 1.0);
        assert_eq!(result.name, UNKNOWN);
        assert!((result.distance - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_tie_keeps_first_name() {
        let store = store_with(&[("Bob", &[0.0, 1.0]), ("Alice", &[1.0, 0.0])]);
        let result = find_best_match(&arr1(&[0.0, 0.0]), &store, 2.0);
        assert_eq!(result.name, "Alice");
    }

    #[test]
    fn test_separated_clusters_never_confused() {
        let threshold = 0.5;
        let store = store_with(&[
            ("Alice", &[0.0, 0.0]),
            ("Alice", &[0.1, 0.1]),
            ("Bob", &[5.0, 5.0]),
            ("Bob", &[5.1, 4.9]),
        ]);

        for i in 0..10 {
            let jitter = i as f32 * 0.02;
            let near_alice = find_best_match(&arr1(&[jitter, 0.05]), &store, threshold);
            let near_bob = find_best_match(&arr1(&[5.0 + jitter, 5.0]), &store, threshold);
            assert_eq!(near_alice.name, "Alice");
            assert_eq!(near_bob.name, "Bob");
        }
    }

    #[test]
    fn test_mismatched_dimension_is_skipped() {
        let store = store_with(&[("Alice", &[0.0, 0.0])]);
        let result = find_best_match(&arr1(&[0.0, 0.0, 0.0]), &store, 1.0);
        assert_eq!(result.name, UNKNOWN);
        assert!(result.distance.is_infinite());
    }
}
