//! Identity normalizer
//!
//! Canonical form used whenever two labels must be compared for "same
//! intent": trimmed, diacritics stripped, lower-cased, internal
//! whitespace runs collapsed to one space.

use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

/// Normalize a container/item label for comparison
///
/// Pure and total; `"Commun"`, `"  commun "` and `"COMMUN"` are equal
/// after normalization, as are `"Café"` and `"cafe"`.
pub fn normalize(label: &str) -> String {
    let folded: String = label
        .nfd()
        .filter(|c| !is_combining_mark(*c))
        .flat_map(char::to_lowercase)
        .collect();

    folded.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// True when both labels normalize to the same string
pub fn same_label(a: &str, b: &str) -> bool {
    normalize(a) == normalize(b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_case_and_padding_fold() {
        assert_eq!(normalize("Commun"), "commun");
        assert_eq!(normalize("  commun "), "commun");
        assert_eq!(normalize("COMMUN"), "commun");
    }

    #[test]
    fn test_diacritics_stripped() {
        assert_eq!(normalize("Catégorie Partagée"), "categorie partagee");
        assert!(same_label("Café", "CAFE"));
    }

    #[test]
    fn test_internal_whitespace_collapsed() {
        assert_eq!(normalize("shared \t\n  pool"), "shared pool");
    }

    #[test]
    fn test_empty_and_blank() {
        assert_eq!(normalize(""), "");
        assert_eq!(normalize(" \t "), "");
    }

    #[test]
    fn test_idempotent() {
        let once = normalize("  Ëlève  DU   Cours ");
        assert_eq!(normalize(&once), once);
    }
}
