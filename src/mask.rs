//! Secret masking for the sanitized `docker_command` persisted to the
//! execution log (spec.md §4.6). Applied to every env-var value written
//! to the log, never to the command actually executed.

/// `len <= 4` -> `****`; `len <= 8` -> first 2 + `****` + last 2; else
/// first 2 + `********` + last 2.
pub fn mask(value: &str) -> String {
    let len = value.chars().count();
    if len <= 4 {
        return "****".to_string();
    }
    let chars: Vec<char> = value.chars().collect();
    if len <= 8 {
        let head: String = chars[..2].iter().collect();
        let tail: String = chars[len - 2..].iter().collect();
        format!("{head}****{tail}")
    } else {
        let head: String = chars[..2].iter().collect();
        let tail: String = chars[len - 2..].iter().collect();
        format!("{head}********{tail}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_values_fully_masked() {
        assert_eq!(mask(""), "****");
        assert_eq!(mask("ab"), "****");
        assert_eq!(mask("abcd"), "****");
    }

    #[test]
    fn medium_values_keep_two_chars_each_side() {
        assert_eq!(mask("abcde"), "ab****de");
        assert_eq!(mask("abcdefgh"), "ab****gh");
    }

    #[test]
    fn long_values_keep_two_chars_each_side_wider_band() {
        assert_eq!(mask("abcdefghi"), "ab********hi");
        assert_eq!(mask("correct-horse-battery-staple"), "co********le");
    }

    #[test]
    fn mask_is_idempotent() {
        for v in ["", "a", "abcd", "abcde", "abcdefgh", "abcdefghijk", "supersecrettoken1234"] {
            let once = mask(v);
            let twice = mask(&once);
            assert_eq!(once, twice, "mask({v:?}) not idempotent");
        }
    }

    #[test]
    fn mask_length_is_one_of_three_bands() {
        let long = "x".repeat(50);
        for v in ["", "a", "ab", "abc", "abcd", "abcde", "abcdef", "abcdefg", "abcdefgh", "abcdefghi", long.as_str()]
        {
            let masked = mask(v);
            assert!(
                masked.len() == 4 || masked.len() == 8 || masked.len() == 12,
                "mask({v:?}) = {masked:?} has unexpected length {}",
                masked.len()
            );
        }
    }
}
