//! `strip_html` step: message body → scrubbed plain text.

use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::{Captures, Regex};

use crate::error::StepError;
use crate::pipeline::Step;
use crate::scrub::Scrubber;
use crate::store::{Database, MessageEntity, OutputKind};

pub const NAME: &str = "strip_html";

static SCRIPT_OR_STYLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<script\b[^>]*>.*?</script\s*>|<style\b[^>]*>.*?</style\s*>").unwrap()
});
static COMMENT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)<!--.*?-->").unwrap());
static ENTITY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"&(#[0-9]+|#[xX][0-9a-fA-F]+|[a-zA-Z]+);").unwrap());

/// Strip tags and decode entities.
///
/// Script and style blocks are dropped with their contents. Whitespace is
/// collapsed to single spaces.
pub fn html_to_text(html: &str) -> String {
    let html = SCRIPT_OR_STYLE.replace_all(html, " ");
    let html = COMMENT.replace_all(&html, " ");

    let mut result = String::with_capacity(html.len());
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' if in_tag => {
                in_tag = false;
                // Tags separate words: "<p>a</p><p>b</p>" is "a b".
                result.push(' ');
            }
            _ if !in_tag => result.push(ch),
            _ => {}
        }
    }

    let decoded = decode_entities(&result);
    decoded.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn decode_entities(text: &str) -> String {
    ENTITY
        .replace_all(text, |caps: &Captures| {
            let name = &caps[1];
            let decoded = if let Some(hex) = name.strip_prefix("#x").or(name.strip_prefix("#X")) {
                u32::from_str_radix(hex, 16).ok().and_then(char::from_u32)
            } else if let Some(dec) = name.strip_prefix('#') {
                dec.parse::<u32>().ok().and_then(char::from_u32)
            } else {
                match name {
                    "amp" => Some('&'),
                    "lt" => Some('<'),
                    "gt" => Some('>'),
                    "quot" => Some('"'),
                    "apos" => Some('\''),
                    "nbsp" => Some(' '),
                    _ => None,
                }
            };
            match decoded {
                Some(c) => c.to_string(),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// Scrubbed plain text for a message: HTML body if present, else text body.
pub fn plain_text_for(entity: &MessageEntity, scrubber: &Scrubber) -> String {
    let raw = match (&entity.body_html, &entity.body_text) {
        (Some(html), _) if !html.trim().is_empty() => html_to_text(html),
        (_, Some(text)) => text.trim().to_string(),
        _ => String::new(),
    };
    scrubber.scrub(&raw).content
}

/// Extracts plain text and persists it as the entity's `plain_text` output.
pub struct StripHtmlStep {
    db: Arc<dyn Database>,
    scrubber: Arc<Scrubber>,
}

impl StripHtmlStep {
    pub fn new(db: Arc<dyn Database>, scrubber: Arc<Scrubber>) -> Self {
        Self { db, scrubber }
    }
}

#[async_trait]
impl Step for StripHtmlStep {
    async fn run(&self, entity: &MessageEntity) -> Result<(), StepError> {
        let text = plain_text_for(entity, &self.scrubber);
        tracing::debug!(entity = %entity.id, chars = text.len(), "Extracted plain text");
        self.db
            .save_output(&entity.id, OutputKind::PlainText, &text)
            .await?;
        Ok(())
    }
}
