//! Name normalisation and short-name generation for stored documents.

use uuid::Uuid;

const SHORT_ID_ALPHABET: &[u8; 64] =
    b"0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ_-";
const SHORT_ID_LEN: usize = 10;

/// Lowercase `name`, replacing every character outside `[A-Za-z0-9_]` with `_`.
pub fn sanitize_model_name(name: Option<&str>) -> String {
    name.unwrap_or_default()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect()
}

/// Short random, URL-safe identifier used for auto-generated names.
pub fn generate_short_id() -> String {
    let seed = Uuid::new_v4();
    seed.as_bytes()
        .iter()
        .take(SHORT_ID_LEN)
        .map(|b| SHORT_ID_ALPHABET[(b & 0x3f) as usize] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn sanitizes_display_names() {
        assert_eq!(sanitize_model_name(Some("My Report!")), "my_report_");
        assert_eq!(sanitize_model_name(Some("already_ok_42")), "already_ok_42");
        assert_eq!(sanitize_model_name(Some("a-b.c/d")), "a_b_c_d");
        assert_eq!(sanitize_model_name(Some("Café")), "caf_");
    }

    #[test]
    fn sanitize_is_total() {
        assert_eq!(sanitize_model_name(None), "");
        assert_eq!(sanitize_model_name(Some("")), "");
        assert_eq!(sanitize_model_name(Some("   ")), "___");
    }

    #[test]
    fn sanitize_is_idempotent() {
        let once = sanitize_model_name(Some("Quarterly Numbers (Q3)"));
        assert_eq!(sanitize_model_name(Some(&once)), once);
    }

    #[test]
    fn short_ids_are_url_safe_and_distinct() {
        let ids: HashSet<String> = (0..1000).map(|_| generate_short_id()).collect();
        assert_eq!(ids.len(), 1000);
        for id in &ids {
            assert_eq!(id.len(), SHORT_ID_LEN);
            assert!(id.bytes().all(|b| SHORT_ID_ALPHABET.contains(&b)));
        }
    }
}
