//! Raw RFC 822 mail → stored message entities.
//!
//! Parsing uses `mail-parser`. Re-ingesting a message whose Message-ID is
//! already stored does not create a second entity; it records a `duplicate`
//! execution log against the existing one.

use std::path::Path;

use chrono::{DateTime, Utc};
use mail_parser::{HeaderValue, Message, MessageParser, PartType};
use uuid::Uuid;

use crate::error::IngestError;
use crate::store::{Database, LogStatus, NewMessage};

/// Step name used for ingest-time execution logs.
pub const INGEST_STEP: &str = "ingest";

/// Outcome of ingesting one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ingested {
    /// Stored as a new entity with this id.
    New(String),
    /// Already present; id of the existing entity.
    Duplicate(String),
}

impl Ingested {
    pub fn entity_id(&self) -> &str {
        match self {
            Self::New(id) | Self::Duplicate(id) => id,
        }
    }
}

/// Parse raw mail bytes into a message ready for insertion.
pub fn parse_raw_email(raw: &[u8]) -> Result<NewMessage, IngestError> {
    if raw.iter().all(u8::is_ascii_whitespace) {
        return Err(IngestError::Unparseable("empty message".to_string()));
    }
    let parsed = MessageParser::default()
        .parse(raw)
        .ok_or_else(|| IngestError::Unparseable("no RFC 822 headers found".to_string()))?;

    let external_id = parsed
        .message_id()
        .map(|s| s.to_string())
        .unwrap_or_else(|| format!("gen-{}@mailflow", Uuid::new_v4()));

    let thread_id = first_id(parsed.references())
        .or_else(|| first_id(parsed.in_reply_to()))
        .unwrap_or_else(|| external_id.clone());

    let received_at = parsed
        .date()
        .and_then(|d| DateTime::<Utc>::from_timestamp(d.to_timestamp(), 0));

    Ok(NewMessage {
        external_id,
        thread_id: Some(thread_id),
        sender: extract_sender(&parsed),
        subject: parsed.subject().map(|s| s.trim().to_string()),
        body_text: first_body(parsed.text_bodies(), false),
        body_html: first_body(parsed.html_bodies(), true),
        received_at,
    })
}

/// Parse and store one message.
pub async fn ingest_raw_email(db: &dyn Database, raw: &[u8]) -> Result<Ingested, IngestError> {
    let message = parse_raw_email(raw)?;

    if let Some(existing) = db.get_message_by_external_id(&message.external_id).await? {
        tracing::info!(
            id = %existing.id,
            external_id = %message.external_id,
            "Duplicate message, not stored again"
        );
        db.append_execution_log(
            &existing.id,
            INGEST_STEP,
            LogStatus::Duplicate,
            &serde_json::json!({ "external_id": message.external_id }),
        )
        .await?;
        return Ok(Ingested::Duplicate(existing.id));
    }

    let id = db.insert_message(&message).await?;
    tracing::info!(
        id = %id,
        external_id = %message.external_id,
        sender = %message.sender,
        "Message ingested"
    );
    Ok(Ingested::New(id))
}

/// Read a `.eml` file and ingest it.
pub async fn ingest_file(db: &dyn Database, path: &Path) -> Result<Ingested, IngestError> {
    let raw = tokio::fs::read(path).await?;
    ingest_raw_email(db, &raw).await
}

/// First message id in a `References` / `In-Reply-To` header.
fn first_id(value: &HeaderValue) -> Option<String> {
    let id: &str = match value {
        HeaderValue::Text(id) => Some(id.as_ref()),
        HeaderValue::TextList(ids) => ids.first().map(|id| id.as_ref()),
        _ => None,
    }?;
    let id = id.trim();
    (!id.is_empty()).then(|| id.to_string())
}

/// Extract the sender address from a parsed email.
fn extract_sender(parsed: &Message) -> String {
    parsed
        .from()
        .and_then(|addr| addr.first())
        .and_then(|a| a.address())
        .map(|s| s.to_string())
        .unwrap_or_else(|| "unknown".into())
}

/// Content of the first body part of the wanted kind.
///
/// mail-parser lists a plain part among the HTML bodies (and vice versa)
/// when the other alternative is missing, so the part type is checked.
fn first_body<'a, 'x: 'a>(
    mut parts: impl Iterator<Item = &'a mail_parser::MessagePart<'x>>,
    html: bool,
) -> Option<String> {
    parts.find_map(|part| match (&part.body, html) {
        (PartType::Html(content), true) | (PartType::Text(content), false) => {
            Some(content.to_string())
        }
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LibSqlBackend;
    use std::sync::Arc;

    const PLAIN: &str = "From: Alice <alice@example.com>\r\n\
To: bob@example.com\r\n\
Subject: Lunch\r\n\
Message-ID: <lunch-1@example.com>\r\n\
Date: Wed, 1 May 2024 09:00:00 +0000\r\n\
\r\n\
Lunch at noon?\r\n";

    const REPLY: &str = "From: bob@example.com\r\n\
Subject: Re: Lunch\r\n\
Message-ID: <lunch-2@example.com>\r\n\
In-Reply-To: <lunch-1@example.com>\r\n\
Date: Wed, 1 May 2024 10:00:00 +0000\r\n\
Content-Type: text/html; charset=utf-8\r\n\
\r\n\
<p>Sounds <b>good</b></p>\r\n";

    const FOLLOW_UP: &str = "From: carol@example.com\r\n\
Subject: Re: Lunch\r\n\
Message-ID: <lunch-3@example.com>\r\n\
In-Reply-To: <lunch-2@example.com>\r\n\
References: <lunch-1@example.com> <lunch-2@example.com>\r\n\
\r\n\
Count me in\r\n";

    #[test]
    fn parses_plain_message() {
        let msg = parse_raw_email(PLAIN.as_bytes()).unwrap();
        assert_eq!(msg.external_id, "lunch-1@example.com");
        assert_eq!(msg.thread_id.as_deref(), Some("lunch-1@example.com"));
        assert_eq!(msg.sender, "alice@example.com");
        assert_eq!(msg.subject.as_deref(), Some("Lunch"));
        assert!(msg.body_text.unwrap().contains("Lunch at noon?"));
        assert!(msg.body_html.is_none());
        assert_eq!(
            msg.received_at.unwrap().to_rfc3339(),
            "2024-05-01T09:00:00+00:00"
        );
    }

    #[test]
    fn thread_from_in_reply_to_then_references() {
        let reply = parse_raw_email(REPLY.as_bytes()).unwrap();
        assert_eq!(reply.thread_id.as_deref(), Some("lunch-1@example.com"));
        assert!(reply.body_html.unwrap().contains("<b>good</b>"));

        let follow_up = parse_raw_email(FOLLOW_UP.as_bytes()).unwrap();
        assert_eq!(follow_up.thread_id.as_deref(), Some("lunch-1@example.com"));
    }

    #[test]
    fn generates_missing_message_id() {
        let raw = "From: x@example.com\r\nSubject: hi\r\n\r\nbody\r\n";
        let msg = parse_raw_email(raw.as_bytes()).unwrap();
        assert!(msg.external_id.starts_with("gen-"));
        assert_eq!(msg.thread_id.as_deref(), Some(msg.external_id.as_str()));
    }

    #[test]
    fn rejects_empty_input() {
        assert!(matches!(
            parse_raw_email(b"  \r\n"),
            Err(IngestError::Unparseable(_))
        ));
    }

    #[tokio::test]
    async fn duplicate_ingest_logs_and_returns_existing() {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());

        let first = ingest_raw_email(db.as_ref(), PLAIN.as_bytes()).await.unwrap();
        let Ingested::New(id) = first.clone() else {
            panic!("expected a new entity");
        };

        let second = ingest_raw_email(db.as_ref(), PLAIN.as_bytes()).await.unwrap();
        assert_eq!(second, Ingested::Duplicate(id.clone()));
        assert_eq!(second.entity_id(), first.entity_id());

        let logs = db.list_execution_logs(&id).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].step_name, INGEST_STEP);
        assert_eq!(logs[0].status, LogStatus::Duplicate);
        assert_eq!(logs[0].details["external_id"], "lunch-1@example.com");

        // A duplicate record never touches the step arrays.
        let status = db.get_processing_status(&id).await.unwrap().unwrap();
        assert!(status.completed_steps.is_empty());
        assert!(status.failed_steps.is_empty());
    }

    #[tokio::test]
    async fn ingest_file_reads_eml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reply.eml");
        std::fs::write(&path, REPLY).unwrap();

        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let result = ingest_file(db.as_ref(), &path).await.unwrap();
        let entity = db.load_entity(result.entity_id()).await.unwrap().unwrap();
        assert_eq!(entity.external_id, "lunch-2@example.com");

        let missing = ingest_file(db.as_ref(), &dir.path().join("nope.eml")).await;
        assert!(matches!(missing, Err(IngestError::Io(_))));
    }
}
