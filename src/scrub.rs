//! PII scrubber. Masks personal data in text before it is persisted or sent
//! to the LLM.
//!
//! Rules run in order. Card numbers are masked before phone numbers so a
//! long digit run is never half-matched as a phone.

use regex::Regex;

/// One masking rule.
#[derive(Debug, Clone)]
pub struct ScrubRule {
    pub name: String,
    pub regex: Regex,
    pub replacement: String,
}

/// Scrubbed text plus what was changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScrubbedText {
    pub content: String,
    /// Number of replacements across all rules.
    pub redactions: usize,
}

impl ScrubbedText {
    pub fn was_modified(&self) -> bool {
        self.redactions > 0
    }
}

/// Ordered set of masking rules.
#[derive(Debug, Clone)]
pub struct Scrubber {
    rules: Vec<ScrubRule>,
}

impl Scrubber {
    /// Scrubber masking email addresses, card numbers, and phone numbers.
    pub fn default_rules() -> Self {
        let rules = vec![
            ScrubRule {
                name: "email".into(),
                regex: Regex::new(r"(?i)\b[a-z0-9._%+\-]+@[a-z0-9.\-]+\.[a-z]{2,}\b").unwrap(),
                replacement: "[EMAIL]".into(),
            },
            // 13-19 digits, optionally grouped by spaces or dashes
            ScrubRule {
                name: "card".into(),
                regex: Regex::new(r"\b(?:\d[ \-]?){12,18}\d\b").unwrap(),
                replacement: "[CARD]".into(),
            },
            ScrubRule {
                name: "phone".into(),
                regex: Regex::new(
                    r"(?:\+\d{1,3}[\s.\-]?)?(?:\(\d{3}\)\s?|\b\d{3}[\s.\-]?)\d{3}[\s.\-]?\d{4}\b",
                )
                .unwrap(),
                replacement: "[PHONE]".into(),
            },
        ];

        Self { rules }
    }

    /// Append a custom rule; it runs after the existing ones.
    pub fn add_rule(
        &mut self,
        name: &str,
        pattern: &str,
        replacement: &str,
    ) -> Result<(), regex::Error> {
        self.rules.push(ScrubRule {
            name: name.into(),
            regex: Regex::new(pattern)?,
            replacement: replacement.into(),
        });
        Ok(())
    }

    pub fn rules(&self) -> &[ScrubRule] {
        &self.rules
    }

    /// Apply every rule in order.
    pub fn scrub(&self, text: &str) -> ScrubbedText {
        let mut content = text.to_string();
        let mut redactions = 0;

        for rule in &self.rules {
            let hits = rule.regex.find_iter(&content).count();
            if hits == 0 {
                continue;
            }
            redactions += hits;
            content = rule
                .regex
                .replace_all(&content, rule.replacement.as_str())
                .into_owned();
        }

        ScrubbedText {
            content,
            redactions,
        }
    }
}

impl Default for Scrubber {
    fn default() -> Self {
        Self::default_rules()
    }
}
