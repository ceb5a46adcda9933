//! Fuzzy author-position matching.
//!
//! Pure functions only: given a document's ordered author list and the
//! name variants of one claimant, find the author slot the claim belongs
//! to and merge it into the per-document verified/unverified arrays.

use crate::error::Result;
use crate::models::ClaimStatus;
use serde::{Deserialize, Serialize};
use unicode_normalization::UnicodeNormalization;

/// Slot value meaning "no identity claimed this position".
pub const PLACEHOLDER: &str = "-";

/// Canonicalize a name for comparison: drop periods, collapse whitespace
/// runs, lowercase, NFKC.
pub fn normalize_name(name: &str) -> String {
    let no_periods: String = name.chars().filter(|c| *c != '.').collect();
    let collapsed = no_periods.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed.to_lowercase().nfkc().collect()
}

/// Similarity ratio in [0, 1]; 1.0 means identical. Symmetric.
///
/// Edit-distance based with substitutions weighted 2 (a substitution is
/// never cheaper than delete + insert), so the ratio reduces to
/// `2 * lcs / (len_a + len_b)`. E.g. "Neumann, John" vs "Neuman, J"
/// scores ~0.818.
pub fn similarity_ratio(a: &str, b: &str) -> f64 {
    let a_chars: Vec<char> = a.chars().collect();
    let b_chars: Vec<char> = b.chars().collect();
    let len_sum = a_chars.len() + b_chars.len();
    if len_sum == 0 {
        return 1.0;
    }

    let mut matrix = vec![vec![0usize; b_chars.len() + 1]; a_chars.len() + 1];
    for (i, row) in matrix.iter_mut().enumerate() {
        row[0] = i;
    }
    for j in 0..=b_chars.len() {
        matrix[0][j] = j;
    }
    for i in 1..=a_chars.len() {
        for j in 1..=b_chars.len() {
            let sub = if a_chars[i - 1] == b_chars[j - 1] { 0 } else { 2 };
            matrix[i][j] = (matrix[i - 1][j] + 1)
                .min(matrix[i][j - 1] + 1)
                .min(matrix[i - 1][j - 1] + sub);
        }
    }

    let dist = matrix[a_chars.len()][b_chars.len()];
    (len_sum - dist) as f64 / len_sum as f64
}

/// Find the author position best matching any of the claimant's name
/// variants.
///
/// Every (variant, author) pair is scored; the best pair wins, ties going
/// to the pair encountered first. Returns `None` when the best ratio is
/// strictly below `min_ratio` — an expected outcome, not an error.
pub fn find_position(authors: &[String], variants: &[String], min_ratio: f64) -> Option<usize> {
    let authors: Vec<String> = authors.iter().map(|a| normalize_name(a)).collect();
    let variants: Vec<String> = variants.iter().map(|v| normalize_name(v)).collect();

    let mut best: Option<(f64, usize)> = None;
    for variant in &variants {
        for (aidx, author) in authors.iter().enumerate() {
            let ratio = similarity_ratio(author, variant);
            if best.map_or(true, |(r, _)| ratio > r) {
                best = Some((ratio, aidx));
            }
        }
    }

    match best {
        Some((ratio, idx)) if ratio >= min_ratio => Some(idx),
        _ => None,
    }
}

/// The per-document author-position record the merge stage maintains.
///
/// `authors` is the document's immutable canonical author list; the two
/// parallel arrays hold identity ids (or [`PLACEHOLDER`]) and always have
/// the same length as `authors`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuthorPositionRecord {
    pub authors: Vec<String>,
    #[serde(default)]
    pub verified: Vec<String>,
    #[serde(default)]
    pub unverified: Vec<String>,
}

/// The fields of a claim that drive a merge.
#[derive(Debug, Clone, Default)]
pub struct PositionClaim {
    pub identity_id: String,
    pub status: Option<ClaimStatus>,
    /// Claim originated from a platform-authenticated account.
    pub verified: bool,
    /// Name fields in descending match priority.
    pub author: Vec<String>,
    pub registry_name: Vec<String>,
    pub author_norm: Vec<String>,
}

/// Merge a claim into the record.
///
/// Picks the verified or unverified array, pads it to the author-list
/// length, and tries the claim's name fields in priority order; the first
/// field producing a match wins. A `removed` claim writes the placeholder
/// back. Returns the matched index, or `None` with the record unchanged.
pub fn apply_claim(
    record: &mut AuthorPositionRecord,
    claim: &PositionClaim,
    min_ratio: f64,
) -> Result<Option<usize>> {
    let num_authors = record.authors.len();
    let slots = if claim.verified {
        &mut record.verified
    } else {
        &mut record.unverified
    };
    if slots.len() != num_authors {
        slots.resize(num_authors, PLACEHOLDER.to_string());
    }

    for variants in [&claim.author, &claim.registry_name, &claim.author_norm] {
        if variants.is_empty() {
            continue;
        }
        if let Some(idx) = find_position(&record.authors, variants, min_ratio) {
            slots[idx] = if claim.status == Some(ClaimStatus::Removed) {
                PLACEHOLDER.to_string()
            } else {
                claim.identity_id.clone()
            };
            return Ok(Some(idx));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn strs(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_normalize_name() {
        assert_eq!(normalize_name("Stern,   D."), "stern, d");
        assert_eq!(normalize_name("  Barrière, Nicolas M. "), "barrière, nicolas m");
    }

    #[test]
    fn test_similarity_ratio_weights_substitutions() {
        assert_eq!(similarity_ratio("abc", "abc"), 1.0);
        assert_eq!(similarity_ratio("", ""), 1.0);
        let r = similarity_ratio("Neumann, John", "Neuman, J");
        assert!((r - 0.8181818).abs() < 1e-6, "got {}", r);
        // symmetric
        assert_eq!(r, similarity_ratio("Neuman, J", "Neumann, John"));
    }

    #[test]
    fn test_find_position_stern_at_12() {
        let authors = strs(&[
            "Barrière, Nicolas M.",
            "Krivonos, Roman",
            "Tomsick, John A.",
            "Bachetti, Matteo",
            "Boggs, Steven E.",
            "Chakrabarty, Deepto",
            "Christensen, Finn E.",
            "Craig, William W.",
            "Hailey, Charles J.",
            "Harrison, Fiona A.",
            "Hong, Jaesub",
            "Mori, Kaya",
            "Stern, Daniel",
            "Zhang, William W.",
        ]);
        let variants = strs(&["Stern, D.", "Stern, Daniel"]);
        assert_eq!(find_position(&authors, &variants, 0.6), Some(12));
    }

    #[test]
    fn test_find_position_bounds_and_threshold() {
        let authors = strs(&["Adams, A.", "Brown, B.", "Clark, C."]);
        let variants = strs(&["Zzyzx, Q."]);
        // below threshold is a plain None
        assert_eq!(find_position(&authors, &variants, 0.9), None);
        // any match must index into the author list
        for ratio in [0.0, 0.3, 0.6, 0.9, 1.0] {
            if let Some(idx) = find_position(&authors, &variants, ratio) {
                assert!(idx < authors.len());
            }
        }
        // empty inputs never match
        assert_eq!(find_position(&[], &variants, 0.0), None);
        assert_eq!(find_position(&authors, &[], 0.0), None);
    }

    #[test]
    fn test_apply_claim_then_remove_round_trip() {
        let mut record = AuthorPositionRecord {
            authors: strs(&["Stern, Daniel", "Zhang, William W."]),
            ..Default::default()
        };
        let mut claim = PositionClaim {
            identity_id: "0000-0001-2345-6789".to_string(),
            status: Some(ClaimStatus::Claimed),
            verified: false,
            author: strs(&["Stern, D.", "Stern, Daniel"]),
            ..Default::default()
        };

        let idx = apply_claim(&mut record, &claim, 0.6).unwrap();
        assert_eq!(idx, Some(0));
        assert_eq!(record.unverified[0], "0000-0001-2345-6789");
        assert_eq!(record.unverified[1], PLACEHOLDER);
        assert!(record.verified.is_empty());

        claim.status = Some(ClaimStatus::Removed);
        let idx = apply_claim(&mut record, &claim, 0.6).unwrap();
        assert_eq!(idx, Some(0));
        // never a stale identity id left behind
        assert_eq!(record.unverified[0], PLACEHOLDER);
    }

    #[test]
    fn test_apply_claim_verified_array_and_field_priority() {
        let mut record = AuthorPositionRecord {
            authors: strs(&["Craig, William W.", "Hong, Jaesub"]),
            ..Default::default()
        };
        let claim = PositionClaim {
            identity_id: "0000-0002-0000-0001".to_string(),
            status: Some(ClaimStatus::Claimed),
            verified: true,
            // no full-name variants; falls through to the registry name
            registry_name: strs(&["Hong, Jaesub"]),
            ..Default::default()
        };
        assert_eq!(apply_claim(&mut record, &claim, 0.6).unwrap(), Some(1));
        assert_eq!(record.verified, strs(&[PLACEHOLDER, "0000-0002-0000-0001"]));
        assert!(record.unverified.is_empty());
    }

    #[test]
    fn test_apply_claim_no_match_leaves_record_unchanged() {
        let mut record = AuthorPositionRecord {
            authors: strs(&["Adams, A."]),
            unverified: strs(&["0000-0003-0000-0002"]),
            ..Default::default()
        };
        let before = record.clone();
        let claim = PositionClaim {
            identity_id: "x".to_string(),
            author: strs(&["Completely Different"]),
            ..Default::default()
        };
        assert_eq!(apply_claim(&mut record, &claim, 0.95).unwrap(), None);
        assert_eq!(record, before);
    }
}
