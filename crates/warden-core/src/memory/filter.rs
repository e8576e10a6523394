//! Telemetry-stripping filter applied before every durable memory write.
//!
//! Hard invariant, not optional hygiene: the broker's trust model depends on no
//! identifying or phone-home payload being retained in any tier. The scrub list
//! is explicit and reviewed, never inferred:
//!
//! - URLs pointing at posthog / segment / analytics / telemetry / sentry hosts
//! - `posthog|segment|mixpanel|amplitude|fullstory = <value>` assignments
//! - `api_key = <value>` and `token = <value>` assignments
//! - bare phone-home strings (posthog, segment.com, telemetry, phone-home, ...)
//!
//! The filter is idempotent: clean(clean(x)) == clean(x).

use once_cell::sync::Lazy;
use regex::Regex;

const REDACTED: &str = "[REDACTED]";

static TELEMETRY_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)https?://\S*(?:posthog|segment|analytics|telemetry|ph\.|sentry\.io)\S*",
        r"(?i)\b(?:posthog|segment|mixpanel|amplitude|fullstory)\s*[=:]\s*\S+",
        r"(?i)api[_-]?key\s*[=:]\s*\S+",
        r"(?i)token\s*[=:]\s*\S+",
        // Bare phone-home markers, after the URL/assignment passes above.
        r"(?i)phone[-_]home|telemetry|send_analytics|report_usage|posthog|segment\.com",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("static telemetry pattern"))
    .collect()
});

/// Scrub tracking payloads and credential assignments from text before it hits
/// any memory tier.
pub fn clean_telemetry(text: &str) -> String {
    let mut out = text.to_string();
    for pattern in TELEMETRY_PATTERNS.iter() {
        out = pattern.replace_all(&out, REDACTED).into_owned();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_tracking_urls() {
        let cleaned = clean_telemetry("see https://eu.posthog.com/capture?x=1 for events");
        assert!(!cleaned.contains("posthog.com"));
        assert!(cleaned.contains(REDACTED));
    }

    #[test]
    fn strips_key_assignments() {
        let cleaned = clean_telemetry("api_key=sk-12345 token: abc99 mixpanel=tok99");
        assert!(!cleaned.contains("sk-12345"));
        assert!(!cleaned.contains("abc99"));
        assert!(!cleaned.contains("tok99"));
    }

    #[test]
    fn strips_phone_home_strings_case_insensitive() {
        let cleaned = clean_telemetry("enable Telemetry and PHONE-HOME now");
        assert!(!cleaned.to_lowercase().contains("telemetry"));
        assert!(!cleaned.to_lowercase().contains("phone-home"));
    }

    #[test]
    fn idempotent() {
        let inputs = [
            "plain infrastructure note about node-7",
            "api_key=deadbeef plus https://segment.com/track",
            "posthog posthog posthog",
            "",
        ];
        for input in inputs {
            let once = clean_telemetry(input);
            let twice = clean_telemetry(&once);
            assert_eq!(once, twice, "clean must be idempotent for {input:?}");
        }
    }

    #[test]
    fn leaves_clean_text_untouched() {
        let input = "node x-7 is in maintenance until thursday";
        assert_eq!(clean_telemetry(input), input);
    }
}
