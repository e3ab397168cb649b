//! `aggregate_conversation` step: the entity's whole thread as one document.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::StepError;
use crate::pipeline::Step;
use crate::scrub::Scrubber;
use crate::steps::strip_html::plain_text_for;
use crate::store::{Database, MessageEntity, OutputKind};

pub const NAME: &str = "aggregate_conversation";

/// Concatenates every message in the entity's thread, oldest first, and
/// saves the result as the entity's `conversation` output.
///
/// Siblings that have not been through `strip_html` yet are extracted on
/// the fly, so the aggregate never contains unscrubbed text.
pub struct AggregateConversationStep {
    db: Arc<dyn Database>,
    scrubber: Arc<Scrubber>,
}

impl AggregateConversationStep {
    pub fn new(db: Arc<dyn Database>, scrubber: Arc<Scrubber>) -> Self {
        Self { db, scrubber }
    }

    async fn thread_of(&self, entity: &MessageEntity) -> Result<Vec<MessageEntity>, StepError> {
        let Some(thread_id) = &entity.thread_id else {
            return Ok(vec![entity.clone()]);
        };

        let mut thread = self.db.list_thread_messages(thread_id).await?;
        if !thread.iter().any(|m| m.id == entity.id) {
            thread.push(entity.clone());
            thread.sort_by(|a, b| {
                a.received_at
                    .cmp(&b.received_at)
                    .then_with(|| a.id.cmp(&b.id))
            });
        }
        Ok(thread)
    }
}

#[async_trait]
impl Step for AggregateConversationStep {
    async fn run(&self, entity: &MessageEntity) -> Result<(), StepError> {
        let thread = self.thread_of(entity).await?;
        let total = thread.len();

        let mut sections = Vec::with_capacity(total);
        for (index, message) in thread.iter().enumerate() {
            let body = match self.db.get_output(&message.id, OutputKind::PlainText).await? {
                Some(text) => text,
                None => plain_text_for(message, &self.scrubber),
            };

            let mut section = format!(
                "--- Message {} of {} ---\nFrom: {}\nDate: {}\n",
                index + 1,
                total,
                self.scrubber.scrub(&message.sender).content,
                message.received_at.format("%Y-%m-%d %H:%M UTC"),
            );
            if let Some(subject) = message.subject.as_deref().filter(|s| !s.trim().is_empty()) {
                section.push_str(&format!("Subject: {}\n", self.scrubber.scrub(subject).content));
            }
            section.push('\n');
            section.push_str(&body);
            sections.push(section);
        }

        let conversation = sections.join("\n\n");
        tracing::debug!(
            entity = %entity.id,
            messages = total,
            chars = conversation.len(),
            "Aggregated conversation"
        );

        self.db
            .save_output(&entity.id, OutputKind::Conversation, &conversation)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{LibSqlBackend, NewMessage};
    use chrono::{TimeZone, Utc};

    async fn insert(
        db: &dyn Database,
        external_id: &str,
        thread_id: Option<&str>,
        body: &str,
        hour: u32,
    ) -> String {
        db.insert_message(&NewMessage {
            external_id: external_id.into(),
            thread_id: thread_id.map(Into::into),
            sender: "alice@example.com".into(),
            subject: Some("Plans".into()),
            body_text: Some(body.into()),
            received_at: Some(Utc.with_ymd_and_hms(2024, 5, 1, hour, 0, 0).unwrap()),
            ..Default::default()
        })
        .await
        .unwrap()
    }

    fn step(db: &Arc<dyn Database>) -> AggregateConversationStep {
        AggregateConversationStep::new(Arc::clone(db), Arc::new(Scrubber::default()))
    }

    #[tokio::test]
    async fn aggregates_thread_in_received_order() {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let second = insert(db.as_ref(), "<2@x>", Some("<1@x>"), "Sounds good", 10).await;
        let first = insert(db.as_ref(), "<1@x>", Some("<1@x>"), "Lunch at noon?", 9).await;
        // Already-extracted text wins over the raw body.
        db.save_output(&first, OutputKind::PlainText, "Lunch at noon? (extracted)")
            .await
            .unwrap();

        let entity = db.load_entity(&second).await.unwrap().unwrap();
        step(&db).run(&entity).await.unwrap();

        let conversation = db
            .get_output(&second, OutputKind::Conversation)
            .await
            .unwrap()
            .unwrap();
        let first_pos = conversation.find("Lunch at noon? (extracted)").unwrap();
        let second_pos = conversation.find("Sounds good").unwrap();
        assert!(first_pos < second_pos);
        assert!(conversation.starts_with("--- Message 1 of 2 ---\nFrom: [EMAIL]\nDate: 2024-05-01 09:00 UTC\nSubject: Plans\n"));
        assert!(!conversation.contains("alice@example.com"));
    }

    #[tokio::test]
    async fn single_message_without_thread() {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let id = insert(db.as_ref(), "<solo@x>", None, "ring 555-123-4567", 8).await;
        let entity = db.load_entity(&id).await.unwrap().unwrap();

        let step = step(&db);
        step.run(&entity).await.unwrap();
        let once = db.get_output(&id, OutputKind::Conversation).await.unwrap();
        step.run(&entity).await.unwrap();
        let twice = db.get_output(&id, OutputKind::Conversation).await.unwrap();

        assert_eq!(once, twice);
        let text = once.unwrap();
        assert!(text.contains("Message 1 of 1"));
        assert!(text.ends_with("ring [PHONE]"));
    }
}
