use crate::consts::DISPLAY_ID_PREFIX;

use rand::Rng;
use time::OffsetDateTime;

/// Operator-facing call reference: prefix, `yyMMddHHmm` and a random three digit suffix.
pub fn generate_display_id(now: OffsetDateTime) -> String {
    let suffix: u16 = rand::thread_rng().gen_range(100..=999);
    format!(
        "{DISPLAY_ID_PREFIX}{:02}{:02}{:02}{:02}{:02}{suffix}",
        now.year() % 100,
        u8::from(now.month()),
        now.day(),
        now.hour(),
        now.minute(),
    )
}

/// Upper-case a UK postcode and put exactly one space before the three character inward code.
pub fn normalize_postcode(raw: &str) -> String {
    let compact: String = raw
        .chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| c.to_ascii_uppercase())
        .collect();
    if (5..=7).contains(&compact.len()) && compact.is_ascii() {
        let (outward, inward) = compact.split_at(compact.len() - 3);
        format!("{outward} {inward}")
    } else {
        compact
    }
}

/// `ILIKE` pattern matching `keyword` anywhere, with wildcards in the keyword escaped.
pub fn like_pattern(keyword: &str) -> String {
    let mut pattern = String::with_capacity(keyword.len() + 2);
    pattern.push('%');
    for c in keyword.chars() {
        if matches!(c, '%' | '_' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}

/// Keep a carrier id safe to use as a file name.
pub fn file_stem(call_sid: &str) -> Option<&str> {
    let ok = !call_sid.is_empty()
        && call_sid
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    ok.then_some(call_sid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn display_id_has_timestamp_and_suffix() {
        let id = generate_display_id(datetime!(2026-03-07 09:05 UTC));
        assert!(id.starts_with("WK2603070905"), "{id}");
        assert_eq!(id.len(), "WK2603070905".len() + 3);
        let suffix: u16 = id[id.len() - 3..].parse().unwrap();
        assert!((100..=999).contains(&suffix));
    }

    #[test]
    fn postcodes_are_normalized() {
        assert_eq!(normalize_postcode("ls14ed"), "LS1 4ED");
        assert_eq!(normalize_postcode("LU7  2RC"), "LU7 2RC");
        assert_eq!(normalize_postcode("sw1a 1aa"), "SW1A 1AA");
        assert_eq!(normalize_postcode("LS1"), "LS1");
    }

    #[test]
    fn like_pattern_escapes_wildcards() {
        assert_eq!(like_pattern("smith"), "%smith%");
        assert_eq!(like_pattern("50%_off"), "%50\\%\\_off%");
    }

    #[test]
    fn file_stem_rejects_paths() {
        assert_eq!(file_stem("CA1234abcd"), Some("CA1234abcd"));
        assert_eq!(file_stem("../etc/passwd"), None);
        assert_eq!(file_stem(""), None);
    }
}
