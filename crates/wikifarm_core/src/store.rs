//! Persistence of requests and their comment threads.
//!
//! `RequestStore` is the seam the lifecycle talks to; `SqliteRequestStore`
//! backs it with the `cw_requests` and `cw_comments` tables.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::Serialize;

use crate::clock::{format_mw_timestamp, parse_mw_timestamp};
use crate::db::with_immediate_transaction;
use crate::error::{ConflictField, RequestError, RequestResult};
use crate::request::{RequestDetails, RequestId, UserId};
use crate::status::RequestStatus;

/// Full persisted row of a request, minus its identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestRow {
    pub details: RequestDetails,
    pub requester: UserId,
    pub status: RequestStatus,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRequest {
    pub id: RequestId,
    pub row: RequestRow,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommentRow {
    pub request: RequestId,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub author: UserId,
}

/// The fields of an in-review request that new requests must not repeat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenRequest {
    pub id: RequestId,
    pub dbname: String,
    pub sitename: String,
    pub description: String,
}

#[derive(Debug, Clone, Default)]
pub struct RequestFilter {
    pub status: Option<RequestStatus>,
    pub requester: Option<UserId>,
    pub max_visibility: Option<i64>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RequestSummary {
    pub id: RequestId,
    pub sitename: String,
    pub dbname: String,
    pub url: String,
    pub requester: UserId,
    pub status: RequestStatus,
    pub timestamp: DateTime<Utc>,
    pub visibility: i64,
}

pub trait RequestStore {
    fn select_one(&self, id: RequestId) -> Result<Option<StoredRequest>>;

    /// Comments for a request, newest first.
    fn select_comments(&self, id: RequestId) -> Result<Vec<CommentRow>>;

    fn insert_comment(&self, comment: &CommentRow) -> Result<()>;

    /// Insert (`id == None`) or update the row keyed by `id`.
    ///
    /// Inserting a new row fails with [`RequestError::Conflict`] when it
    /// repeats a field of an open request.
    fn upsert(&self, id: Option<RequestId>, row: &RequestRow) -> RequestResult<RequestId>;

    fn select_open_requests(&self) -> Result<Vec<OpenRequest>>;

    fn list_requests(&self, filter: &RequestFilter) -> Result<Vec<RequestSummary>>;
}

/// First open request sharing a sitename, dbname or description with `details`.
pub fn find_conflict(
    open: &[OpenRequest],
    details: &RequestDetails,
) -> Option<(ConflictField, RequestId)> {
    open.iter().find_map(|existing| {
        if existing.sitename == details.sitename {
            Some((ConflictField::Sitename, existing.id))
        } else if existing.dbname == details.dbname {
            Some((ConflictField::Dbname, existing.id))
        } else if existing.description == details.description {
            Some((ConflictField::Description, existing.id))
        } else {
            None
        }
    })
}

pub struct SqliteRequestStore<'a> {
    connection: &'a Connection,
}

impl<'a> SqliteRequestStore<'a> {
    pub fn new(connection: &'a Connection) -> Self {
        Self { connection }
    }

    fn insert_new(&self, row: &RequestRow) -> RequestResult<RequestId> {
        with_immediate_transaction(self.connection, || {
            let open = self.select_open_requests()?;
            if let Some((field, existing)) = find_conflict(&open, &row.details) {
                return Err(RequestError::Conflict { field, existing });
            }

            self.connection
                .execute(
                    "INSERT INTO cw_requests (
                        cw_comment,
                        cw_dbname,
                        cw_language,
                        cw_private,
                        cw_status,
                        cw_sitename,
                        cw_timestamp,
                        cw_url,
                        cw_user,
                        cw_category,
                        cw_visibility
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                    params![
                        row.details.description,
                        row.details.dbname,
                        row.details.language,
                        row.details.private,
                        row.status.as_str(),
                        row.details.sitename,
                        format_mw_timestamp(row.timestamp),
                        row.details.url,
                        row.requester.0,
                        row.details.category,
                        row.details.visibility,
                    ],
                )
                .with_context(|| format!("failed to insert request {}", row.details.sitename))?;
            Ok(RequestId(self.connection.last_insert_rowid()))
        })
    }

    fn upsert_existing(&self, id: RequestId, row: &RequestRow) -> Result<RequestId> {
        // cw_timestamp is only written on first insert.
        self.connection
            .execute(
                "INSERT INTO cw_requests (
                    cw_id,
                    cw_comment,
                    cw_dbname,
                    cw_language,
                    cw_private,
                    cw_status,
                    cw_sitename,
                    cw_timestamp,
                    cw_url,
                    cw_user,
                    cw_category,
                    cw_visibility
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                ON CONFLICT(cw_id) DO UPDATE SET
                    cw_comment = excluded.cw_comment,
                    cw_dbname = excluded.cw_dbname,
                    cw_language = excluded.cw_language,
                    cw_private = excluded.cw_private,
                    cw_status = excluded.cw_status,
                    cw_sitename = excluded.cw_sitename,
                    cw_url = excluded.cw_url,
                    cw_user = excluded.cw_user,
                    cw_category = excluded.cw_category,
                    cw_visibility = excluded.cw_visibility",
                params![
                    id.0,
                    row.details.description,
                    row.details.dbname,
                    row.details.language,
                    row.details.private,
                    row.status.as_str(),
                    row.details.sitename,
                    format_mw_timestamp(row.timestamp),
                    row.details.url,
                    row.requester.0,
                    row.details.category,
                    row.details.visibility,
                ],
            )
            .with_context(|| format!("failed to upsert request {id}"))?;
        Ok(id)
    }
}

impl RequestStore for SqliteRequestStore<'_> {
    fn select_one(&self, id: RequestId) -> Result<Option<StoredRequest>> {
        let raw = self
            .connection
            .query_row(
                "SELECT cw_id, cw_comment, cw_dbname, cw_language, cw_private, cw_status,
                        cw_sitename, cw_timestamp, cw_url, cw_user, cw_category, cw_visibility
                 FROM cw_requests
                 WHERE cw_id = ?1",
                [id.0],
                RawRequest::from_row,
            )
            .optional()
            .with_context(|| format!("failed to load request {id}"))?;
        raw.map(RawRequest::into_stored).transpose()
    }

    fn select_comments(&self, id: RequestId) -> Result<Vec<CommentRow>> {
        let mut statement = self
            .connection
            .prepare(
                "SELECT cw_comment, cw_comment_timestamp, cw_comment_user
                 FROM cw_comments
                 WHERE cw_id = ?1
                 ORDER BY cw_comment_timestamp DESC, cw_comment_id DESC",
            )
            .context("failed to prepare comment query")?;
        let rows = statement
            .query_map([id.0], |row| {
                let text: String = row.get(0)?;
                let timestamp: String = row.get(1)?;
                let author: i64 = row.get(2)?;
                Ok((text, timestamp, author))
            })
            .with_context(|| format!("failed to load comments for request {id}"))?;

        let mut out = Vec::new();
        for row in rows {
            let (text, timestamp, author) = row.context("failed to read comment row")?;
            out.push(CommentRow {
                request: id,
                text,
                timestamp: parse_mw_timestamp(&timestamp)?,
                author: UserId(author),
            });
        }
        Ok(out)
    }

    fn insert_comment(&self, comment: &CommentRow) -> Result<()> {
        self.connection
            .execute(
                "INSERT INTO cw_comments (cw_id, cw_comment, cw_comment_timestamp, cw_comment_user)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    comment.request.0,
                    comment.text,
                    format_mw_timestamp(comment.timestamp),
                    comment.author.0,
                ],
            )
            .with_context(|| format!("failed to insert comment on request {}", comment.request))?;
        Ok(())
    }

    fn upsert(&self, id: Option<RequestId>, row: &RequestRow) -> RequestResult<RequestId> {
        match id {
            Some(id) => Ok(self.upsert_existing(id, row)?),
            None => self.insert_new(row),
        }
    }

    fn select_open_requests(&self) -> Result<Vec<OpenRequest>> {
        let mut statement = self
            .connection
            .prepare(
                "SELECT cw_id, cw_dbname, cw_sitename, cw_comment
                 FROM cw_requests
                 WHERE cw_status = ?1
                 ORDER BY cw_id ASC",
            )
            .context("failed to prepare open request query")?;
        let rows = statement
            .query_map([RequestStatus::InReview.as_str()], |row| {
                Ok(OpenRequest {
                    id: RequestId(row.get(0)?),
                    dbname: row.get(1)?,
                    sitename: row.get(2)?,
                    description: row.get(3)?,
                })
            })
            .context("failed to run open request query")?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("failed to read open request row")?);
        }
        Ok(out)
    }

    fn list_requests(&self, filter: &RequestFilter) -> Result<Vec<RequestSummary>> {
        let limit = match filter.limit {
            Some(limit) => i64::try_from(limit).context("limit does not fit into i64")?,
            None => -1,
        };
        let mut statement = self
            .connection
            .prepare(
                "SELECT cw_id, cw_sitename, cw_dbname, cw_url, cw_user, cw_status,
                        cw_timestamp, cw_visibility
                 FROM cw_requests
                 WHERE (?1 IS NULL OR cw_status = ?1)
                   AND (?2 IS NULL OR cw_user = ?2)
                   AND (?3 IS NULL OR cw_visibility <= ?3)
                 ORDER BY cw_timestamp DESC, cw_id DESC
                 LIMIT ?4",
            )
            .context("failed to prepare request queue query")?;
        let rows = statement
            .query_map(
                params![
                    filter.status.map(RequestStatus::as_str),
                    filter.requester.map(|user| user.0),
                    filter.max_visibility,
                    limit,
                ],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, i64>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, String>(6)?,
                        row.get::<_, i64>(7)?,
                    ))
                },
            )
            .context("failed to run request queue query")?;

        let mut out = Vec::new();
        for row in rows {
            let (id, sitename, dbname, url, requester, status, timestamp, visibility) =
                row.context("failed to read request queue row")?;
            out.push(RequestSummary {
                id: RequestId(id),
                sitename,
                dbname,
                url,
                requester: UserId(requester),
                status: status.parse()?,
                timestamp: parse_mw_timestamp(&timestamp)?,
                visibility,
            });
        }
        Ok(out)
    }
}

struct RawRequest {
    id: i64,
    description: String,
    dbname: String,
    language: String,
    private: bool,
    status: String,
    sitename: String,
    timestamp: String,
    url: String,
    requester: i64,
    category: String,
    visibility: i64,
}

impl RawRequest {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            description: row.get(1)?,
            dbname: row.get(2)?,
            language: row.get(3)?,
            private: row.get(4)?,
            status: row.get(5)?,
            sitename: row.get(6)?,
            timestamp: row.get(7)?,
            url: row.get(8)?,
            requester: row.get(9)?,
            category: row.get(10)?,
            visibility: row.get(11)?,
        })
    }

    fn into_stored(self) -> Result<StoredRequest> {
        let status = self
            .status
            .parse()
            .with_context(|| format!("request {} has a corrupt status", self.id))?;
        Ok(StoredRequest {
            id: RequestId(self.id),
            row: RequestRow {
                details: RequestDetails {
                    dbname: self.dbname,
                    sitename: self.sitename,
                    url: self.url,
                    language: self.language,
                    category: self.category,
                    description: self.description,
                    private: self.private,
                    visibility: self.visibility,
                },
                requester: UserId(self.requester),
                status,
                timestamp: parse_mw_timestamp(&self.timestamp)?,
            },
        })
    }
}
