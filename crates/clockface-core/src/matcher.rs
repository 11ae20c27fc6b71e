//! Identity matching: nearest enrolled signature under a distance cutoff.

use crate::types::{EmployeeIdentity, FaceDescriptor, MatchResult};

/// Strategy for scoring a query descriptor against the enrolled roster.
pub trait Matcher {
    fn best_match(
        &self,
        query: &FaceDescriptor,
        candidates: &[EmployeeIdentity],
        threshold: f32,
    ) -> MatchResult;
}

/// Linear-scan Euclidean matcher.
///
/// Picks the candidate with the smallest distance and accepts it when that
/// distance is `<= threshold`. Equal distances resolve to the candidate that
/// appears first in `candidates`. A rejected nearest candidate is never
/// reported, only its distance.
///
/// O(n) per query; the roster is one organization's employees.
pub struct EuclideanMatcher;

impl Matcher for EuclideanMatcher {
    fn best_match(
        &self,
        query: &FaceDescriptor,
        candidates: &[EmployeeIdentity],
        threshold: f32,
    ) -> MatchResult {
        let mut best_dist = f32::INFINITY;
        let mut best_idx: Option<usize> = None;

        for (i, candidate) in candidates.iter().enumerate() {
            let dist = query.euclidean_distance(&candidate.signature);
            // Strict `<` keeps the earliest candidate on ties; NaN never wins.
            if dist < best_dist {
                best_dist = dist;
                best_idx = Some(i);
            }
        }

        match best_idx {
            Some(idx) if best_dist <= threshold => MatchResult {
                matched: true,
                employee: Some(candidates[idx].clone()),
                distance: best_dist,
            },
            _ => MatchResult::no_match(best_dist),
        }
    }
}
