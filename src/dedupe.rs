//! Duplicate subscription detection
//!
//! Pure decision logic answering whether a freshly classified candidate is
//! the same billing relationship as an already stored record. Exact matching
//! compares normalized vendor names and emails; fuzzy matching uses an
//! edit-distance ratio plus an amount tolerance. Missing fields are skipped,
//! never treated as mismatches.

use strsim::normalized_levenshtein;

use crate::config::DedupeConfig;

/// Corporate suffix tokens dropped from the end of vendor names.
const CORPORATE_SUFFIXES: &[&str] = &["inc", "llc", "ltd", "co", "corp", "corporation", "company"];

/// The fields duplicate detection compares, borrowed from either side.
#[derive(Debug, Clone, Copy)]
pub struct VendorRecord<'a> {
    pub name: &'a str,
    pub email: Option<&'a str>,
    pub amount: Option<f64>,
}

/// Threshold-configured duplicate decision.
#[derive(Debug, Clone)]
pub struct DedupePolicy {
    name_threshold: f64,
    email_threshold: f64,
    amount_tolerance: f64,
}

impl DedupePolicy {
    pub fn new(config: &DedupeConfig) -> Self {
        Self {
            name_threshold: config.name_threshold,
            email_threshold: config.email_threshold,
            amount_tolerance: config.amount_tolerance,
        }
    }

    /// Decide whether `candidate` duplicates `existing`.
    pub fn is_duplicate(&self, candidate: &VendorRecord<'_>, existing: &VendorRecord<'_>) -> bool {
        self.is_exact_match(candidate, existing) || self.is_fuzzy_match(candidate, existing)
    }

    /// Normalized vendor name equality and normalized email equality.
    fn is_exact_match(&self, candidate: &VendorRecord<'_>, existing: &VendorRecord<'_>) -> bool {
        if normalize_vendor_name(candidate.name) != normalize_vendor_name(existing.name) {
            return false;
        }

        match (candidate.email, existing.email) {
            (Some(a), Some(b)) => normalize_email(a) == normalize_email(b),
            (None, None) => true,
            _ => false,
        }
    }

    /// Similarity-based match; every applicable sub-check must pass.
    fn is_fuzzy_match(&self, candidate: &VendorRecord<'_>, existing: &VendorRecord<'_>) -> bool {
        let name_similarity = normalized_levenshtein(
            &normalize_vendor_name(candidate.name),
            &normalize_vendor_name(existing.name),
        );
        if name_similarity < self.name_threshold {
            return false;
        }

        if let (Some(a), Some(b)) = (candidate.email, existing.email) {
            let email_similarity = normalized_levenshtein(&normalize_email(a), &normalize_email(b));
            if email_similarity < self.email_threshold {
                return false;
            }
        }

        if let (Some(a), Some(b)) = (candidate.amount, existing.amount)
            && (a - b).abs() > self.amount_tolerance + f64::EPSILON
        {
            return false;
        }

        true
    }
}

impl Default for DedupePolicy {
    fn default() -> Self {
        Self::new(&DedupeConfig::default())
    }
}

/// Lowercase, strip punctuation, collapse whitespace, and drop trailing
/// corporate suffixes ("Netflix Inc." -> "netflix").
pub fn normalize_vendor_name(name: &str) -> String {
    let cleaned: String = name
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();

    let mut tokens: Vec<&str> = cleaned.split_whitespace().collect();
    while tokens.len() > 1
        && tokens
            .last()
            .is_some_and(|token| CORPORATE_SUFFIXES.contains(token))
    {
        tokens.pop();
    }

    tokens.join(" ")
}

/// Lowercase and trim an email address.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record<'a>(name: &'a str, email: Option<&'a str>, amount: Option<f64>) -> VendorRecord<'a> {
        VendorRecord {
            name,
            email,
            amount,
        }
    }

    #[test]
    fn vendor_name_normalization() {
        assert_eq!(normalize_vendor_name("Netflix, Inc."), "netflix");
        assert_eq!(normalize_vendor_name("  Spotify   AB "), "spotify ab");
        assert_eq!(normalize_vendor_name("ACME Corp"), "acme");
        // A bare suffix word is a name, not a suffix.
        assert_eq!(normalize_vendor_name("Inc"), "inc");
    }

    #[test]
    fn exact_match_on_name_and_email() {
        let policy = DedupePolicy::default();
        assert!(policy.is_duplicate(
            &record("Netflix", Some("billing@netflix.com"), Some(15.99)),
            &record("netflix", Some("Billing@Netflix.com"), Some(15.99)),
        ));
    }

    #[test]
    fn near_identical_vendor_with_matching_email_and_amount_is_duplicate() {
        let policy = DedupePolicy::default();
        assert!(policy.is_duplicate(
            &record("Netflix", Some("billing@netflix.com"), Some(15.99)),
            &record("Netflix Inc.", Some("billing@netflix.com"), Some(16.00)),
        ));
    }

    #[test]
    fn different_vendors_never_match() {
        let policy = DedupePolicy::default();
        assert!(!policy.is_duplicate(
            &record("Netflix", Some("billing@netflix.com"), Some(15.99)),
            &record("Spotify", Some("billing@netflix.com"), Some(15.99)),
        ));
    }

    #[test]
    fn amount_outside_tolerance_blocks_fuzzy_match() {
        let policy = DedupePolicy::default();
        assert!(!policy.is_duplicate(
            &record("Netflx", Some("billing@netflix.com"), Some(15.99)),
            &record("Netflix", Some("billing@netflix.com"), Some(19.99)),
        ));
    }

    #[test]
    fn dissimilar_emails_block_fuzzy_match() {
        let policy = DedupePolicy::default();
        assert!(!policy.is_duplicate(
            &record("Netflx", Some("billing@netflix.com"), Some(15.99)),
            &record("Netflix", Some("accounts@wholly-different.example"), Some(15.99)),
        ));
    }

    #[test]
    fn missing_fields_are_skipped_not_mismatched() {
        let policy = DedupePolicy::default();
        // No emails and no amounts anywhere: name similarity alone decides.
        assert!(policy.is_duplicate(
            &record("Netflix", None, None),
            &record("Netflix Inc.", None, None),
        ));
        // One side missing the email skips the email check.
        assert!(policy.is_duplicate(
            &record("Netflix", Some("billing@netflix.com"), Some(15.99)),
            &record("Netflix", None, Some(15.99)),
        ));
    }

    #[test]
    fn amount_tolerance_boundary() {
        let policy = DedupePolicy::default();
        assert!(policy.is_duplicate(
            &record("Netflix", None, Some(15.99)),
            &record("Netflix", None, Some(16.00)),
        ));
        assert!(!policy.is_duplicate(
            &record("Netflx", None, Some(15.99)),
            &record("Netflix", None, Some(16.02)),
        ));
    }

    #[test]
    fn name_threshold_is_configurable() {
        let strict = DedupePolicy::new(&DedupeConfig {
            name_threshold: 0.99,
            ..DedupeConfig::default()
        });
        assert!(!strict.is_duplicate(
            &record("Netflx", None, None),
            &record("Netflix", None, None),
        ));
    }
}
