// SPDX-License-Identifier: MIT OR Apache-2.0
//! Product matching against the active catalog: an exact phase over the
//! normalized name, then a fuzzy phase scored by Levenshtein ratio.
//!
//! Ties in the fuzzy phase break by catalog scan order, which the loader
//! guarantees to be alphabetical by `norm_name`. The whole match is a pure
//! function of the raw string, the catalog slice, and the threshold.
#![deny(unsafe_code)]

use despacho_core::CatalogProduct;
use despacho_norm::norm;

/// Default fuzzy acceptance threshold, in ratio points (0–100).
pub const DEFAULT_FUZZY_THRESHOLD: f64 = 80.0;

/// Outcome of matching one raw product string.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchOutcome {
    /// A catalog entry with an identical normalized name.
    Exact {
        /// Matched catalog row id.
        product_id: i64,
        /// Family of the matched product.
        family: i64,
    },
    /// The best fuzzy candidate met the threshold.
    Fuzzy {
        /// Matched catalog row id.
        product_id: i64,
        /// Family of the matched product.
        family: i64,
        /// Score in `[0, 1]` (ratio / 100).
        score: f64,
    },
    /// Nothing in the catalog was close enough.
    NoMatch,
}

impl MatchOutcome {
    /// Whether this outcome names a product.
    pub fn is_match(&self) -> bool {
        !matches!(self, Self::NoMatch)
    }
}

/// Match `raw` against `catalog` with the given threshold (ratio points).
///
/// An empty normalized key or an empty catalog is `NoMatch`.
pub fn match_product(raw: &str, catalog: &[CatalogProduct], threshold: f64) -> MatchOutcome {
    let key = norm(raw);
    if key.is_empty() || catalog.is_empty() {
        return MatchOutcome::NoMatch;
    }

    if let Some(hit) = catalog.iter().find(|p| p.norm_name == key) {
        return MatchOutcome::Exact {
            product_id: hit.id,
            family: hit.family,
        };
    }

    // Fuzzy phase: strict `>` keeps the earliest candidate on ties, so the
    // result follows the catalog's scan order.
    let mut best: Option<(&CatalogProduct, f64)> = None;
    for p in catalog {
        let ratio = levenshtein_ratio(&key, &p.norm_name);
        if best.map(|(_, b)| ratio > b).unwrap_or(true) {
            best = Some((p, ratio));
        }
    }

    match best {
        Some((p, ratio)) if ratio >= threshold => MatchOutcome::Fuzzy {
            product_id: p.id,
            family: p.family,
            score: ratio / 100.0,
        },
        _ => MatchOutcome::NoMatch,
    }
}

/// Levenshtein ratio in points: `100 · (1 − distance / max(len_a, len_b))`.
pub fn levenshtein_ratio(a: &str, b: &str) -> f64 {
    strsim::normalized_levenshtein(a, b) * 100.0
}
