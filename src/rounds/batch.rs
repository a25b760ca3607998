use std::collections::HashMap;

use crate::backend::ScoreEntry;

/// Partition an ordered score list into batches capped at `cap` entries,
/// without ever splitting entries that share a beneficiary across batches.
///
/// A new batch starts only when adding the next whole group would exceed the
/// cap; a single group larger than the cap forms one oversized batch on its
/// own. Batches preserve the order in which beneficiaries first appear.
pub fn group_score_jobs(scores: &[ScoreEntry], cap: usize) -> Vec<Vec<ScoreEntry>> {
    let mut order: Vec<&str> = Vec::new();
    let mut groups: HashMap<&str, Vec<ScoreEntry>> = HashMap::new();
    for score in scores {
        let key = score.beneficiary.as_str();
        if !groups.contains_key(key) {
            order.push(key);
        }
        groups.entry(key).or_default().push(score.clone());
    }

    let group_count = order.len();
    let mut batches: Vec<Vec<ScoreEntry>> = Vec::new();
    let mut current: Vec<ScoreEntry> = Vec::new();

    for key in order {
        let Some(group) = groups.remove(key) else {
            continue;
        };
        if !current.is_empty() && current.len() + group.len() > cap {
            batches.push(std::mem::take(&mut current));
        }
        current.extend(group);
    }
    if !current.is_empty() {
        batches.push(current);
    }

    tracing::debug!(
        scores = scores.len(),
        groups = group_count,
        batches = batches.len(),
        "Grouped scores into batches"
    );

    batches
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(beneficiary: &str, operator: &str) -> ScoreEntry {
        ScoreEntry {
            beneficiary: beneficiary.to_string(),
            operator: operator.to_string(),
            staked: "100".to_string(),
            running: 1.0,
        }
    }

    fn entries(beneficiary: &str, n: usize) -> Vec<ScoreEntry> {
        (0..n)
            .map(|i| entry(beneficiary, &format!("op-{}", i)))
            .collect()
    }

    #[test]
    fn empty_input_yields_no_batches() {
        assert!(group_score_jobs(&[], 420).is_empty());
    }

    #[test]
    fn concatenation_equals_input_per_group() {
        let mut scores = entries("a", 3);
        scores.extend(entries("b", 2));
        scores.extend(entries("a", 0));
        let batches = group_score_jobs(&scores, 420);
        let flat: Vec<ScoreEntry> = batches.into_iter().flatten().collect();
        assert_eq!(flat, scores);
    }

    #[test]
    fn single_oversized_group_forms_one_batch() {
        // 500 entries all sharing one beneficiary, cap 420
        let scores = entries("whale", 500);
        let batches = group_score_jobs(&scores, 420);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 500);
    }

    #[test]
    fn group_never_splits_across_batches() {
        // 100 of A then 400 of B with cap 420: adding B to A's batch would
        // exceed the cap, so B starts a fresh batch.
        let mut scores = entries("a", 100);
        scores.extend(entries("b", 400));
        let batches = group_score_jobs(&scores, 420);
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].len(), 100);
        assert_eq!(batches[1].len(), 400);
        assert!(batches[0].iter().all(|s| s.beneficiary == "a"));
        assert!(batches[1].iter().all(|s| s.beneficiary == "b"));
    }

    #[test]
    fn groups_pack_up_to_cap() {
        let mut scores = entries("a", 200);
        scores.extend(entries("b", 200));
        scores.extend(entries("c", 200));
        let batches = group_score_jobs(&scores, 420);
        // a+b fit (400 <= 420), c spills over
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].len(), 400);
        assert_eq!(batches[1].len(), 200);
    }

    #[test]
    fn interleaved_entries_are_colocated_by_key() {
        let scores = vec![
            entry("a", "op-1"),
            entry("b", "op-2"),
            entry("a", "op-3"),
            entry("b", "op-4"),
        ];
        let batches = group_score_jobs(&scores, 420);
        assert_eq!(batches.len(), 1);
        // a's entries first (first appearance order), then b's
        let keys: Vec<&str> = batches[0].iter().map(|s| s.beneficiary.as_str()).collect();
        assert_eq!(keys, vec!["a", "a", "b", "b"]);
    }

    #[test]
    fn every_batch_respects_cap_unless_single_group() {
        let mut scores = Vec::new();
        for g in 0..50 {
            scores.extend(entries(&format!("g{}", g), 17));
        }
        let batches = group_score_jobs(&scores, 100);
        for batch in &batches {
            assert!(batch.len() <= 100);
        }
        let total: usize = batches.iter().map(|b| b.len()).sum();
        assert_eq!(total, scores.len());
    }
}
