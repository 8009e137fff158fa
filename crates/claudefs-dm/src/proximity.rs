//! Best-source ranking for downloads.
//!
//! Candidates are ordered in three tiers: storage elements local to the
//! invoking site (directory order), then storage elements in the same
//! country, then everything else. The last two tiers are shuffled so that
//! clients do not all pile onto the same element.

use rand::seq::SliceRandom;
use rand::Rng;

use crate::types::BackendId;

/// Order `candidates` by proximity to the invoking site.
///
/// Every candidate appears exactly once in the output.
pub fn rank_sources<R: Rng + ?Sized>(
    candidates: &[BackendId],
    local: &[BackendId],
    country: &[BackendId],
    rng: &mut R,
) -> Vec<BackendId> {
    let mut ranked: Vec<BackendId> = Vec::with_capacity(candidates.len());
    for backend in local {
        if candidates.contains(backend) && !ranked.contains(backend) {
            ranked.push(backend.clone());
        }
    }

    let mut shuffled: Vec<BackendId> = candidates.to_vec();
    shuffled.shuffle(rng);
    for backend in &shuffled {
        if country.contains(backend) && !ranked.contains(backend) {
            ranked.push(backend.clone());
        }
    }

    shuffled.shuffle(rng);
    for backend in shuffled {
        if !ranked.contains(&backend) {
            ranked.push(backend);
        }
    }
    ranked
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn ids(names: &[&str]) -> Vec<BackendId> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_tiers() {
        let local = ids(&["A", "B"]);
        let country = ids(&["C"]);
        let candidates = ids(&["D", "C", "B"]);
        for seed in 0..32 {
            let mut rng = StdRng::seed_from_u64(seed);
            let ranked = rank_sources(&candidates, &local, &country, &mut rng);
            assert_eq!(ranked, ids(&["B", "C", "D"]));
        }
    }

    #[test]
    fn test_local_order_follows_directory() {
        let local = ids(&["B", "A"]);
        let candidates = ids(&["A", "B", "X"]);
        let mut rng = StdRng::seed_from_u64(7);
        let ranked = rank_sources(&candidates, &local, &[], &mut rng);
        assert_eq!(&ranked[..2], &ids(&["B", "A"])[..]);
        assert_eq!(ranked[2], "X");
    }

    #[test]
    fn test_remainder_is_permutation() {
        let candidates = ids(&["D", "E", "F", "G"]);
        let mut rng = StdRng::seed_from_u64(3);
        let mut ranked = rank_sources(&candidates, &[], &[], &mut rng);
        ranked.sort();
        assert_eq!(ranked, candidates);
    }

    #[test]
    fn test_local_not_in_candidates_is_ignored() {
        let local = ids(&["A"]);
        let candidates = ids(&["Z"]);
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(rank_sources(&candidates, &local, &local, &mut rng), ids(&["Z"]));
    }

    #[test]
    fn test_empty_candidates() {
        let mut rng = StdRng::seed_from_u64(1);
        assert!(rank_sources(&[], &ids(&["A"]), &[], &mut rng).is_empty());
    }
}
