// SPDX-License-Identifier: MIT OR Apache-2.0
//! Deterministic text canonicalization used identically for client names,
//! product names, and route names.
//!
//! The pipeline is fixed: Unicode uppercase, fold the Spanish accent set,
//! drop anything outside `[A-Z0-9 ]`, collapse whitespace runs, trim.
//! No locale dependency; stable across calls.
#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Canonicalize `s` for matching and keying.
///
/// ```
/// assert_eq!(despacho_norm::norm("  Ruta   Norte "), "RUTA NORTE");
/// assert_eq!(despacho_norm::norm("Café Añejo"), "CAFE ANEJO");
/// assert_eq!(despacho_norm::norm("coca-cola"), "COCACOLA");
/// ```
pub fn norm(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut pending_space = false;
    for upper in s.chars().flat_map(char::to_uppercase) {
        let folded = fold_accent(upper);
        match folded {
            'A'..='Z' | '0'..='9' => {
                if pending_space && !out.is_empty() {
                    out.push(' ');
                }
                pending_space = false;
                out.push(folded);
            }
            c if c.is_whitespace() => pending_space = true,
            // Anything else (punctuation, symbols) is dropped outright.
            _ => {}
        }
    }
    out
}

/// Fold the Spanish accent set onto ASCII. Uppercase input only; `norm`
/// uppercases first.
fn fold_accent(c: char) -> char {
    match c {
        'Á' => 'A',
        'É' => 'E',
        'Í' => 'I',
        'Ó' => 'O',
        'Ú' | 'Ü' => 'U',
        'Ñ' => 'N',
        'Ç' => 'C',
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn uppercases_and_trims() {
        assert_eq!(norm("  leche entera  "), "LECHE ENTERA");
    }

    #[test]
    fn folds_spanish_accents_both_cases() {
        assert_eq!(norm("Ávila"), "AVILA");
        assert_eq!(norm("añejo"), "ANEJO");
        assert_eq!(norm("cigüeña"), "CIGUENA");
        assert_eq!(norm("açaí"), "ACAI");
    }

    #[test]
    fn drops_punctuation_without_inserting_spaces() {
        assert_eq!(norm("coca-cola"), "COCACOLA");
        assert_eq!(norm("S.U.P.E.R"), "SUPER");
    }

    #[test]
    fn collapses_whitespace_runs() {
        assert_eq!(norm("Ruta \t\t Norte\n2"), "RUTA NORTE 2");
    }

    #[test]
    fn empty_and_symbol_only_inputs() {
        assert_eq!(norm(""), "");
        assert_eq!(norm("  ¡¿!?  "), "");
    }

    #[test]
    fn digits_survive() {
        assert_eq!(norm("leche 1,5%"), "LECHE 15");
    }

    proptest! {
        #[test]
        fn norm_is_idempotent(s in ".{0,64}") {
            let once = norm(&s);
            prop_assert_eq!(norm(&once), once);
        }

        #[test]
        fn output_alphabet_is_restricted(s in ".{0,64}") {
            let out = norm(&s);
            prop_assert!(out.chars().all(|c| c.is_ascii_uppercase()
                || c.is_ascii_digit()
                || c == ' '));
            prop_assert!(!out.starts_with(' '));
            prop_assert!(!out.ends_with(' '));
            prop_assert!(!out.contains("  "));
        }
    }
}
