//! Radicado (filing number) extraction.
//!
//! Patterns are tried in order over subject and body together. Within a
//! pattern, matches are scanned left to right and the first token containing
//! a digit wins; a pattern with no such token falls through to the next.
//! Every label needs a `:` (or `#`) before the token, so prose such as
//! "Decreto No. 1234" is not read as a radicado.

use std::sync::LazyLock;

use regex::Regex;

/// Token after a label: alphanumeric runs joined by `-` or `/`.
const TOKEN: &str = r"([A-Z0-9]+(?:[-/][A-Z0-9]+)*)";

static PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"\bradicado\s*(?:no\.?|n[°º])?\s*[:#]\s*",
        r"\brad\.?\s*[:#]\s*",
        r"\bno\.\s*:\s*",
        r"\bn[úu]mero\s*:\s*",
        r"\bref\.?\s*:\s*",
    ]
    .iter()
    .filter_map(|label| Regex::new(&format!("(?i){label}{TOKEN}")).ok())
    .collect()
});

/// First radicado found in `subject` then `body`.
pub fn extract_radicado(subject: &str, body: &str) -> Option<String> {
    let haystack = format!("{subject}\n{body}");
    PATTERNS.iter().find_map(|re| {
        re.captures_iter(&haystack)
            .filter_map(|c| c.get(1))
            .map(|m| m.as_str())
            .find(|tok| tok.chars().any(|c| c.is_ascii_digit()))
            .map(str::to_string)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_patterns_compile() {
        assert_eq!(PATTERNS.len(), 5);
    }

    #[test]
    fn radicado_label_in_subject() {
        assert_eq!(
            extract_radicado("Radicado: 322-01527-E25", ""),
            Some("322-01527-E25".into())
        );
    }

    #[test]
    fn radicado_with_number_marker() {
        assert_eq!(
            extract_radicado("Respuesta radicado No.: 2025-000123", ""),
            Some("2025-000123".into())
        );
        assert_eq!(
            extract_radicado("RADICADO N° # 20251234", ""),
            Some("20251234".into())
        );
    }

    #[test]
    fn rad_abbreviation() {
        assert_eq!(
            extract_radicado("Oficio", "Favor citar Rad: SSPD/2025/88 en su respuesta"),
            Some("SSPD/2025/88".into())
        );
    }

    #[test]
    fn numero_and_ref_labels() {
        assert_eq!(extract_radicado("Número: 4455-A", ""), Some("4455-A".into()));
        assert_eq!(extract_radicado("Asunto", "ref: CRA-778"), Some("CRA-778".into()));
        assert_eq!(extract_radicado("No.: 991", ""), Some("991".into()));
    }

    #[test]
    fn earlier_pattern_wins_over_position() {
        // `ref:` appears first in the text but `radicado` is tried first.
        assert_eq!(
            extract_radicado("Ref: 111", "Radicado: 222"),
            Some("222".into())
        );
    }

    #[test]
    fn token_without_digit_falls_through() {
        assert_eq!(
            extract_radicado("Radicado pendiente", "Ref: ABC-12"),
            Some("ABC-12".into())
        );
        assert_eq!(
            extract_radicado("Radicado de entrada, radicado: 77-B", ""),
            Some("77-B".into())
        );
    }

    #[test]
    fn label_without_colon_is_prose() {
        assert_eq!(extract_radicado("Aplicación del Decreto No. 1234 de 2024", ""), None);
        assert_eq!(
            extract_radicado("Respuesta", "El radicado 2025-000123 sigue en trámite"),
            None
        );
        assert_eq!(extract_radicado("Resolución No. 55", "No.: 2025-77"), Some("2025-77".into()));
    }

    #[test]
    fn nothing_found() {
        assert_eq!(extract_radicado("Saludo cordial", "Sin número"), None);
        assert_eq!(extract_radicado("", ""), None);
    }

    #[test]
    fn trailing_separator_not_included() {
        assert_eq!(
            extract_radicado("Radicado: 322-01527-E25.", ""),
            Some("322-01527-E25".into())
        );
    }
}
