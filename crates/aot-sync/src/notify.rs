use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use tokio::fs;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub run_id: Uuid,
    pub subject: String,
    /// Markdown report body.
    pub body: String,
}

/// Delivery channel for the run report.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn deliver(&self, notification: &Notification) -> Result<()>;
}

/// Drops a ready-to-send message into the outbox for an external mail transport.
#[derive(Debug, Clone)]
pub struct OutboxNotifier {
    outbox_dir: PathBuf,
    recipient: Option<String>,
}

impl OutboxNotifier {
    pub fn new(outbox_dir: impl Into<PathBuf>, recipient: Option<String>) -> Self {
        Self {
            outbox_dir: outbox_dir.into(),
            recipient,
        }
    }

    pub fn message_path(&self, notification: &Notification) -> PathBuf {
        self.outbox_dir.join(format!("{}.eml", notification.run_id))
    }

    fn render(&self, notification: &Notification) -> String {
        let mut message = String::new();
        if let Some(recipient) = &self.recipient {
            message.push_str(&format!("To: {recipient}\n"));
        }
        message.push_str(&format!("Subject: {}\n", notification.subject));
        message.push_str("Content-Type: text/markdown; charset=utf-8\n\n");
        message.push_str(&notification.body);
        message
    }
}

#[async_trait]
impl Notifier for OutboxNotifier {
    async fn deliver(&self, notification: &Notification) -> Result<()> {
        fs::create_dir_all(&self.outbox_dir)
            .await
            .with_context(|| format!("creating {}", self.outbox_dir.display()))?;
        let path = self.message_path(notification);
        fs::write(&path, self.render(notification))
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        info!(run_id = %notification.run_id, path = %path.display(), "notification queued in outbox");
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn deliver(&self, notification: &Notification) -> Result<()> {
        info!(run_id = %notification.run_id, subject = %notification.subject, "notification");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notification() -> Notification {
        Notification {
            run_id: Uuid::new_v4(),
            subject: "[AOT] 2025-03-01: 2 new, 1 expiring soon".into(),
            body: "# Academic Opportunity Report\n".into(),
        }
    }

    #[tokio::test]
    async fn outbox_writes_headers_and_body() {
        let dir = tempfile::tempdir().unwrap();
        let notifier = OutboxNotifier::new(dir.path().join("outbox"), Some("investigadora@example.org".into()));
        let n = notification();
        notifier.deliver(&n).await.unwrap();

        let text = std::fs::read_to_string(notifier.message_path(&n)).unwrap();
        assert!(text.starts_with("To: investigadora@example.org\nSubject: [AOT] 2025-03-01"));
        assert!(text.ends_with("# Academic Opportunity Report\n"));
    }

    #[tokio::test]
    async fn outbox_reports_unwritable_directory() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, "x").unwrap();
        let notifier = OutboxNotifier::new(blocker.join("outbox"), None);
        assert!(notifier.deliver(&notification()).await.is_err());
    }
}
