//! Keyword pre-filter bounding the number of paid classifier calls.
//!
//! This is a heuristic, not a classifier: false negatives cost a missed
//! detection, false positives cost one wasted LLM call. Negative keywords are
//! only matched against subject and sender, since legitimate billing mail
//! routinely carries words like "unsubscribe" in the body.

use crate::config::FilterConfig;
use crate::mailbox::EmailContent;

/// Keywords that mark a message as bulk/notification traffic.
const NEGATIVE_KEYWORDS: &[&str] = &[
    "newsletter",
    "digest",
    "webinar",
    "this week in",
    "weekly update",
    "shipped",
    "shipping",
    "out for delivery",
    "tracking number",
    "promo",
    "promotion",
    "flash sale",
    "% off",
    "friend request",
    "password reset",
    "verify your email",
    "security alert",
    "job alert",
];

/// Keywords that make a message worth classifying.
const POSITIVE_KEYWORDS: &[&str] = &[
    "subscription",
    "billing",
    "renewal",
    "renew",
    "receipt",
    "invoice",
    "payment",
    "charged",
    "charge",
    "trial",
    "membership",
    "premium",
    "statement",
    "auto-pay",
    "autopay",
    "plan",
];

/// Body prefix consulted for positive keywords.
const BODY_PREFIX_CHARS: usize = 500;

/// Deterministic, side-effect-free keyword filter.
#[derive(Debug, Clone)]
pub struct EmailFilter {
    positive: Vec<String>,
    negative: Vec<String>,
}

impl EmailFilter {
    /// Build a filter from the built-in sets plus configured extras.
    pub fn new(config: &FilterConfig) -> Self {
        let mut positive: Vec<String> = POSITIVE_KEYWORDS.iter().map(|s| s.to_string()).collect();
        positive.extend(config.extra_positive_keywords.iter().cloned());

        let mut negative: Vec<String> = NEGATIVE_KEYWORDS.iter().map(|s| s.to_string()).collect();
        negative.extend(config.extra_negative_keywords.iter().cloned());

        Self { positive, negative }
    }

    /// Decide whether the message is worth a classifier call.
    pub fn should_process(&self, email: &EmailContent) -> bool {
        let subject = email.subject.to_lowercase();
        let sender = email.sender.to_lowercase();
        let body_prefix: String = email
            .body
            .chars()
            .take(BODY_PREFIX_CHARS)
            .collect::<String>()
            .to_lowercase();

        if self
            .negative
            .iter()
            .any(|kw| subject.contains(kw) || sender.contains(kw))
        {
            return false;
        }

        self.positive
            .iter()
            .any(|kw| subject.contains(kw) || sender.contains(kw) || body_prefix.contains(kw))
    }
}

impl Default for EmailFilter {
    fn default() -> Self {
        Self::new(&FilterConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn email(subject: &str, sender: &str, body: &str) -> EmailContent {
        EmailContent {
            id: "m1".to_string(),
            subject: subject.to_string(),
            sender: sender.to_string(),
            body: body.to_string(),
            received_at: None,
        }
    }

    #[test]
    fn billing_email_passes() {
        let filter = EmailFilter::default();
        assert!(filter.should_process(&email(
            "Your Netflix payment was processed",
            "billing@netflix.com",
            "We processed your payment of $15.99."
        )));
    }

    #[test]
    fn newsletter_without_positive_keyword_is_rejected() {
        let filter = EmailFilter::default();
        assert!(!filter.should_process(&email(
            "This week in tech",
            "newsletter@techcrunch.com",
            "The biggest stories of the week."
        )));
    }

    #[test]
    fn negative_keyword_in_subject_rejects() {
        let filter = EmailFilter::default();
        assert!(!filter.should_process(&email(
            "Your package has shipped",
            "orders@shop.example",
            "Track your delivery."
        )));
    }

    #[test]
    fn no_keywords_at_all_is_rejected() {
        let filter = EmailFilter::default();
        assert!(!filter.should_process(&email(
            "Lunch on Friday?",
            "friend@example.com",
            "Want to grab lunch?"
        )));
    }

    #[test]
    fn positive_keyword_in_body_prefix_passes() {
        let filter = EmailFilter::default();
        assert!(filter.should_process(&email(
            "Thanks!",
            "support@vendor.example",
            "Here is your receipt for this month."
        )));
    }

    #[test]
    fn positive_keyword_beyond_body_prefix_is_ignored() {
        let filter = EmailFilter::default();
        let padded = format!("{}invoice", "x".repeat(600));
        assert!(!filter.should_process(&email("Hello", "someone@example.com", &padded)));
    }

    #[test]
    fn matching_is_case_insensitive() {
        let filter = EmailFilter::default();
        assert!(filter.should_process(&email(
            "RENEWAL NOTICE",
            "Billing@Vendor.example",
            ""
        )));
    }

    #[test]
    fn configured_extras_extend_the_sets() {
        let config = FilterConfig {
            extra_positive_keywords: vec!["abonnement".to_string()],
            extra_negative_keywords: vec!["lottery".to_string()],
        };
        let filter = EmailFilter::new(&config);

        assert!(filter.should_process(&email(
            "Votre abonnement",
            "facture@vendor.example",
            ""
        )));
        assert!(!filter.should_process(&email(
            "Lottery results inside: payment pending",
            "spam@example.com",
            ""
        )));
    }

    #[test]
    fn decision_is_deterministic() {
        let filter = EmailFilter::default();
        let message = email("Subscription renewal", "billing@vendor.example", "");
        let first = filter.should_process(&message);
        for _ in 0..10 {
            assert_eq!(filter.should_process(&message), first);
        }
    }
}
