//! Notification fan-out to the users involved in a request.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};
use serde::Serialize;

use crate::clock::{format_mw_timestamp, parse_mw_timestamp};
use crate::request::{RequestId, User, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NotificationKind {
    #[serde(rename = "request-comment")]
    Comment,
    #[serde(rename = "request-declined")]
    Declined,
}

impl NotificationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Comment => "request-comment",
            Self::Declined => "request-declined",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub kind: NotificationKind,
    pub request: RequestId,
    pub request_url: String,
    /// Comment body or decline reason.
    pub text: String,
    pub notify_agent: bool,
    pub timestamp: DateTime<Utc>,
}

pub trait Notifier {
    fn notify(&self, notification: &Notification, recipients: &[User]) -> Result<()>;
}

/// Writes one outbox row per recipient into `cw_notifications`.
pub struct SqliteOutbox<'a> {
    connection: &'a Connection,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoredNotification {
    pub kind: String,
    pub request: RequestId,
    pub request_url: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl<'a> SqliteOutbox<'a> {
    pub fn new(connection: &'a Connection) -> Self {
        Self { connection }
    }

    /// Notifications delivered to `recipient`, newest first.
    pub fn for_recipient(&self, recipient: UserId) -> Result<Vec<StoredNotification>> {
        let mut statement = self
            .connection
            .prepare(
                "SELECT notification_type, notification_request, notification_url,
                        notification_text, notification_timestamp
                 FROM cw_notifications
                 WHERE notification_recipient = ?1
                 ORDER BY notification_timestamp DESC, notification_id DESC",
            )
            .context("failed to prepare notification query")?;
        let rows = statement
            .query_map([recipient.0], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })
            .with_context(|| format!("failed to load notifications for user {recipient}"))?;

        let mut out = Vec::new();
        for row in rows {
            let (kind, request, request_url, text, timestamp) =
                row.context("failed to read notification row")?;
            out.push(StoredNotification {
                kind,
                request: RequestId(request),
                request_url,
                text,
                timestamp: parse_mw_timestamp(&timestamp)?,
            });
        }
        Ok(out)
    }
}

impl Notifier for SqliteOutbox<'_> {
    fn notify(&self, notification: &Notification, recipients: &[User]) -> Result<()> {
        let mut statement = self
            .connection
            .prepare(
                "INSERT INTO cw_notifications (
                    notification_type,
                    notification_recipient,
                    notification_request,
                    notification_url,
                    notification_text,
                    notification_notify_agent,
                    notification_timestamp
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )
            .context("failed to prepare notification insert")?;
        let timestamp = format_mw_timestamp(notification.timestamp);
        for recipient in recipients {
            statement
                .execute(params![
                    notification.kind.as_str(),
                    recipient.id.0,
                    notification.request.0,
                    notification.request_url,
                    notification.text,
                    notification.notify_agent,
                    timestamp,
                ])
                .with_context(|| format!("failed to queue notification for {}", recipient.name))?;
        }
        tracing::debug!(
            kind = notification.kind.as_str(),
            request = %notification.request,
            recipients = recipients.len(),
            "queued notifications"
        );
        Ok(())
    }
}
