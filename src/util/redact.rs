use regex::Regex;
use std::sync::LazyLock;

/// Matches a standalone 8-digit run: the shape of an approval code.
static EIGHT_DIGITS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\d{8}\b").expect("static regex"));

/// Replaces every standalone 8-digit run in `input` with `[REDACTED]`.
///
/// Applied to every string that reaches the audit log or a log line, so an
/// approval code can never leak through an error message or a summary that
/// happened to embed one.
pub fn redact(input: &str) -> String {
    EIGHT_DIGITS.replace_all(input, "[REDACTED]").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacts_bare_code() {
        assert_eq!(redact("code 12345678 issued"), "code [REDACTED] issued");
    }

    #[test]
    fn leaves_other_digit_runs() {
        assert_eq!(redact("block 1234567"), "block 1234567");
        assert_eq!(redact("nonce 123456789"), "nonce 123456789");
    }

    #[test]
    fn redacts_multiple_runs() {
        let out = redact("a 11112222 b 33334444");
        assert_eq!(out, "a [REDACTED] b [REDACTED]");
    }

    #[test]
    fn output_never_contains_eight_digit_run() {
        let samples = [
            "plain",
            "87654321",
            "x 00000000 y",
            "v=99999999,w=1234567890",
            "0x1234 12345678 0xabcd",
        ];
        for s in samples {
            assert!(!EIGHT_DIGITS.is_match(&redact(s)), "leaked in {s:?}");
        }
    }
}
