//! Suspicion heuristics.
//!
//! Each rule is a pure predicate over a value and its configured pattern set,
//! and produces a [`SuspicionVerdict`] tagged with the rule name. The scanners
//! pick which rules apply to which component kind.

use crate::config::AnalysisConfig;
use crate::types::{RuleName, SuspicionVerdict};
use base64::Engine;

/// Minimum decoded size before a base64 body counts as an embedded payload
const MIN_ENCODED_PAYLOAD: usize = 16;

/// `score > threshold`
pub fn high_entropy(score: f64, threshold: f64) -> bool {
    score > threshold
}

/// True if `name` contains any configured fragment (case-sensitive substring).
///
/// This approximates minifier output where identifiers collapse to one or two
/// characters. With the default single-letter fragments it flags nearly every
/// real component name too; the false-positive rate is a known property of the
/// heuristic, so tune `identifier_fragments` rather than this function.
pub fn suspicious_identifier<S: AsRef<str>>(name: &str, fragments: &[S]) -> bool {
    fragments.iter().map(AsRef::as_ref).filter(|f| !f.is_empty()).any(|f| name.contains(f))
}

/// True if `permission` equals or contains any entry of the sensitive set.
pub fn suspicious_permission<S: AsRef<str>>(permission: &str, sensitive: &[S]) -> bool {
    sensitive.iter().map(AsRef::as_ref).filter(|p| !p.is_empty()).any(|p| permission.contains(p))
}

/// True if the whole payload is a well-formed standard base64 body.
pub fn encoded_payload(data: &[u8]) -> bool {
    let trimmed = data.trim_ascii();
    if trimmed.len() % 4 != 0 || trimmed.len() < MIN_ENCODED_PAYLOAD {
        return false;
    }
    base64::engine::general_purpose::STANDARD
        .decode(trimmed)
        .is_ok_and(|decoded| decoded.len() >= MIN_ENCODED_PAYLOAD)
}

/// Configured rule set, shared read-only by all scanners of a run
#[derive(Debug, Clone)]
pub struct SuspicionRules {
    pub threshold: f64,
    pub identifier_fragments: Vec<String>,
    pub suspicious_permissions: Vec<String>,
    pub detect_encoded_media: bool,
}

impl SuspicionRules {
    pub fn from_config(config: &AnalysisConfig) -> Self {
        Self {
            threshold: config.entropy_threshold,
            identifier_fragments: config.identifier_fragments.clone(),
            suspicious_permissions: config.suspicious_permissions.clone(),
            detect_encoded_media: config.detect_encoded_media,
        }
    }

    pub fn entropy_verdict(&self, score: f64) -> SuspicionVerdict {
        SuspicionVerdict::new(RuleName::HighEntropy, high_entropy(score, self.threshold))
    }

    pub fn identifier_verdict(&self, name: &str) -> SuspicionVerdict {
        SuspicionVerdict::new(
            RuleName::SuspiciousIdentifier,
            suspicious_identifier(name, &self.identifier_fragments),
        )
        .with_detail(name)
    }

    pub fn permission_verdict(&self, permission: &str) -> SuspicionVerdict {
        SuspicionVerdict::new(
            RuleName::SuspiciousPermission,
            suspicious_permission(permission, &self.suspicious_permissions),
        )
        .with_detail(permission)
    }

    pub fn encoded_payload_verdict(&self, data: &[u8]) -> SuspicionVerdict {
        SuspicionVerdict::new(RuleName::EncodedPayload, encoded_payload(data))
    }
}

impl Default for SuspicionRules {
    fn default() -> Self {
        Self::from_config(&AnalysisConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_high_entropy_strict_threshold() {
        assert!(high_entropy(8.0, 7.5));
        assert!(!high_entropy(7.5, 7.5));
        assert!(!high_entropy(0.0, 7.5));
    }

    #[test]
    fn test_high_entropy_monotonic_in_threshold() {
        let scores = [0.0, 3.2, 7.4, 7.5, 7.50001, 7.9, 8.0];
        let thresholds = [8.0, 7.5, 7.0, 5.0, 0.0];
        for score in scores {
            let mut previous = false;
            for t in thresholds {
                let now = high_entropy(score, t);
                // lowering the threshold never clears a flag
                assert!(!previous || now, "score {score} lost flag at threshold {t}");
                previous = now;
            }
        }
    }

    #[test]
    fn test_suspicious_identifier_fragments() {
        let fragments = ["1234", "random"];
        assert!(suspicious_identifier("com.app.Random1234", &fragments));
        assert!(suspicious_identifier("randomService", &fragments));
        assert!(!suspicious_identifier("com.app.MainService", &fragments));
        // case-sensitive
        assert!(!suspicious_identifier("RANDOM", &fragments));
    }

    #[test]
    fn test_default_fragments_flag_short_letters() {
        let rules = SuspicionRules::default();
        assert!(rules.identifier_verdict("a.b").triggered);
        assert!(!rules.identifier_verdict("MONOTONE").triggered);
    }

    #[test]
    fn test_empty_fragments_never_match() {
        let fragments: [&str; 1] = [""];
        assert!(!suspicious_identifier("anything", &fragments));
        let none: [&str; 0] = [];
        assert!(!suspicious_identifier("anything", &none));
    }

    #[test]
    fn test_suspicious_permission() {
        let rules = SuspicionRules::default();
        let v = rules.permission_verdict("android.permission.READ_SMS");
        assert!(v.triggered);
        assert_eq!(v.rule, RuleName::SuspiciousPermission);
        assert_eq!(v.detail.as_deref(), Some("android.permission.READ_SMS"));
        assert!(rules.permission_verdict("READ_CONTACTS").triggered);
        assert!(!rules.permission_verdict("android.permission.VIBRATE").triggered);
    }

    #[test]
    fn test_synthetic_permission_set() {
        assert!(suspicious_permission("android.permission.CAMERA", &["CAMERA"]));
        assert!(!suspicious_permission("android.permission.READ_SMS", &["CAMERA"]));
    }

    #[test]
    fn test_encoded_payload() {
        assert!(encoded_payload(b"SGVsbG8gaGlkZGVuIHBheWxvYWQgaGVyZQ==\n"));
        assert!(!encoded_payload(b"ID3\x03\x00\x00\x00\x00\x00\x00binary mp3 frame"));
        assert!(!encoded_payload(b"QUJD"));
        assert!(!encoded_payload(b""));
    }
}
