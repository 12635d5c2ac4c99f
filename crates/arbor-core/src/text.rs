//! UTF-8-safe text truncation helpers.
//!
//! Byte slicing with `&s[..n]` panics when `n` lands inside a multi-byte
//! character, so these helpers snap down to the nearest char boundary.

/// Longest prefix of `s` that is at most `max_bytes` bytes and ends on a
/// char boundary.
#[must_use]
pub fn clamp_to_boundary(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let end = s
        .char_indices()
        .map(|(i, _)| i)
        .take_while(|&i| i <= max_bytes)
        .last()
        .unwrap_or(0);
    &s[..end]
}

/// Truncate `s` to at most `max_bytes` bytes, appending `suffix` when
/// anything was cut. The result (suffix included) stays within `max_bytes`
/// whenever the suffix alone fits; a suffix longer than the budget is
/// returned whole.
#[must_use]
pub fn preview(s: &str, max_bytes: usize, suffix: &str) -> String {
    if s.len() <= max_bytes {
        return s.to_owned();
    }
    let body = clamp_to_boundary(s, max_bytes.saturating_sub(suffix.len()));
    format!("{body}{suffix}")
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_input_untouched() {
        assert_eq!(clamp_to_boundary("chat", 16), "chat");
        assert_eq!(clamp_to_boundary("chat", 4), "chat");
    }

    #[test]
    fn ascii_cut() {
        assert_eq!(clamp_to_boundary("branching tree", 6), "branch");
    }

    #[test]
    fn empty_and_zero() {
        assert_eq!(clamp_to_boundary("", 8), "");
        assert_eq!(clamp_to_boundary("abc", 0), "");
    }

    #[test]
    fn snaps_below_multibyte_char() {
        // 'ü' is 2 bytes: m(0) ü(1,2) n(3)
        let s = "münchen";
        assert_eq!(clamp_to_boundary(s, 2), "m");
        assert_eq!(clamp_to_boundary(s, 3), "mü");
    }

    #[test]
    fn cjk_three_byte_chars() {
        let s = "日本語"; // each char is 3 bytes
        assert_eq!(clamp_to_boundary(s, 2), "");
        assert_eq!(clamp_to_boundary(s, 3), "日");
        assert_eq!(clamp_to_boundary(s, 5), "日");
        assert_eq!(clamp_to_boundary(s, 6), "日本");
        assert_eq!(clamp_to_boundary(s, 9), "日本語");
    }

    #[test]
    fn four_byte_emoji() {
        let s = "a🌳b"; // a(0) 🌳(1..5) b(5)
        assert_eq!(clamp_to_boundary(s, 1), "a");
        assert_eq!(clamp_to_boundary(s, 4), "a");
        assert_eq!(clamp_to_boundary(s, 5), "a🌳");
    }

    #[test]
    fn preview_fits() {
        assert_eq!(preview("hello", 10, "…"), "hello");
        assert_eq!(preview("hello", 5, "…"), "hello");
    }

    #[test]
    fn preview_truncates_with_suffix() {
        assert_eq!(preview("hello world", 8, "..."), "hello...");
        assert!(preview("hello world", 8, "...").len() <= 8);
    }

    #[test]
    fn preview_suffix_longer_than_budget() {
        assert_eq!(preview("hello", 2, "..."), "...");
    }

    #[test]
    fn preview_respects_char_boundaries() {
        // body budget lands inside the 3-byte '語'
        let s = "日本語とても長い";
        let p = preview(s, 8, "...");
        assert!(p.ends_with("..."));
        assert!(p.len() <= 8);
    }

    #[test]
    fn preview_never_allocates_when_unchanged() {
        let s = "short";
        assert_eq!(preview(s, 100, "..."), s);
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn clamp_is_a_bounded_prefix(s in "\\PC*", max in 0usize..64) {
                let out = clamp_to_boundary(&s, max);
                prop_assert!(s.starts_with(out));
                if s.len() > max {
                    prop_assert!(out.len() <= max);
                } else {
                    prop_assert_eq!(out, s.as_str());
                }
            }

            #[test]
            fn preview_fits_budget_when_suffix_does(s in "\\PC*", max in 3usize..64) {
                let out = preview(&s, max, "…");
                prop_assert!(out.len() <= max);
                if s.len() > max {
                    prop_assert!(out.ends_with('…'));
                }
            }
        }
    }
}
