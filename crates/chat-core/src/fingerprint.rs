use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

/// Number of leading characters that take part in content fingerprints.
pub const FINGERPRINT_SNIPPET_CHARS: usize = 50;

/// Content + time fingerprint used as the weakest pending-match rule.
///
/// Combines the first 50 characters of the content with the timestamp
/// truncated to whole seconds, so an echo that shifts by sub-second server
/// rounding still matches.
pub fn content_fingerprint(content: &str, timestamp_ms: i64) -> String {
    let snippet: String = content.chars().take(FINGERPRINT_SNIPPET_CHARS).collect();
    let secs = timestamp_ms.div_euclid(1_000);

    let mut hasher = Sha256::new();
    hasher.update(snippet.as_bytes());
    hasher.update(b"|");
    hasher.update(secs.to_string().as_bytes());
    let digest = hex::encode(hasher.finalize());
    digest[..16].to_owned()
}

/// Whether both instants fall on the same UTC calendar date.
///
/// Unrepresentable timestamps never match.
pub fn same_utc_date(a_ms: i64, b_ms: i64) -> bool {
    match (
        DateTime::<Utc>::from_timestamp_millis(a_ms),
        DateTime::<Utc>::from_timestamp_millis(b_ms),
    ) {
        (Some(a), Some(b)) => a.date_naive() == b.date_naive(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ignores_sub_second_drift() {
        let a = content_fingerprint("hello", 1_700_000_000_100);
        let b = content_fingerprint("hello", 1_700_000_000_900);
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn only_leading_snippet_participates() {
        let base = "x".repeat(FINGERPRINT_SNIPPET_CHARS);
        let a = content_fingerprint(&format!("{base}tail-one"), 5_000);
        let b = content_fingerprint(&format!("{base}tail-two"), 5_000);
        assert_eq!(a, b);
        assert_ne!(a, content_fingerprint(&base, 6_000));
    }

    #[test]
    fn compares_utc_calendar_dates() {
        // 2023-11-14T22:13:20Z and three hours earlier.
        let t = 1_700_000_000_000;
        assert!(same_utc_date(t, t - 3 * 3_600_000));
        // 2023-11-15T00:30:00Z is the next UTC day.
        assert!(!same_utc_date(t, 1_700_008_200_000));
    }
}
