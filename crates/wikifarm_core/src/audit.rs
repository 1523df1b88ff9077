use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};
use serde::Serialize;
use serde_json::json;

use crate::clock::{format_mw_timestamp, parse_mw_timestamp};
use crate::request::{RequestId, User, UserId};

pub const LOG_TYPE: &str = "farmer";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AuditAction {
    #[serde(rename = "requestaccept")]
    RequestAccept,
    #[serde(rename = "requestdecline")]
    RequestDecline,
}

impl AuditAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RequestAccept => "requestaccept",
            Self::RequestDecline => "requestdecline",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditEntry {
    pub actor: User,
    pub action: AuditAction,
    pub target: RequestId,
    pub timestamp: DateTime<Utc>,
}

pub trait AuditLog {
    fn record(&self, entry: &AuditEntry) -> Result<()>;
}

#[derive(Debug, Clone, Serialize)]
pub struct LoggedAction {
    pub log_id: i64,
    pub action: String,
    pub actor: UserId,
    pub actor_name: String,
    pub target: String,
    pub params: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

/// Audit log kept in the `farm_log` table.
pub struct SqliteAuditLog<'a> {
    connection: &'a Connection,
}

impl<'a> SqliteAuditLog<'a> {
    pub fn new(connection: &'a Connection) -> Self {
        Self { connection }
    }

    /// Most recent entries first.
    pub fn recent(&self, limit: usize) -> Result<Vec<LoggedAction>> {
        let limit = i64::try_from(limit).context("limit does not fit into i64")?;
        let mut statement = self
            .connection
            .prepare(
                "SELECT log_id, log_action, log_actor, log_actor_name, log_target, log_params,
                        log_timestamp
                 FROM farm_log
                 WHERE log_type = ?1
                 ORDER BY log_id DESC
                 LIMIT ?2",
            )
            .context("failed to prepare audit log query")?;
        let rows = statement
            .query_map(params![LOG_TYPE, limit], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                ))
            })
            .context("failed to run audit log query")?;

        let mut out = Vec::new();
        for row in rows {
            let (log_id, action, actor, actor_name, target, params, timestamp) =
                row.context("failed to read audit log row")?;
            out.push(LoggedAction {
                log_id,
                action,
                actor: UserId(actor),
                actor_name,
                target,
                params: serde_json::from_str(&params)
                    .with_context(|| format!("failed to decode params of log entry {log_id}"))?,
                timestamp: parse_mw_timestamp(&timestamp)?,
            });
        }
        Ok(out)
    }
}

/// Log target page for a request queue entry.
pub fn queue_target(id: RequestId) -> String {
    format!("Special:RequestWikiQueue/{id}")
}

impl AuditLog for SqliteAuditLog<'_> {
    fn record(&self, entry: &AuditEntry) -> Result<()> {
        let params_json = json!({ "4::id": format!("#{}", entry.target) }).to_string();
        self.connection
            .execute(
                "INSERT INTO farm_log (
                    log_type,
                    log_action,
                    log_actor,
                    log_actor_name,
                    log_target,
                    log_params,
                    log_timestamp
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    LOG_TYPE,
                    entry.action.as_str(),
                    entry.actor.id.0,
                    entry.actor.name,
                    queue_target(entry.target),
                    params_json,
                    format_mw_timestamp(entry.timestamp),
                ],
            )
            .with_context(|| {
                format!(
                    "failed to write {} log entry for request {}",
                    entry.action.as_str(),
                    entry.target
                )
            })?;
        Ok(())
    }
}
