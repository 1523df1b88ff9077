use anyhow::{Context, Result, bail};
use rusqlite::{Connection, OptionalExtension, params};

use crate::clock::{Clock, format_mw_timestamp};

/// Everything needed to create a wiki.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionRequest {
    pub dbname: String,
    pub sitename: String,
    pub language: String,
    pub description: String,
    pub private: bool,
    pub category: String,
    pub requester: String,
    pub creator: String,
    /// Wikitext linking back to the originating request.
    pub reason: String,
}

pub trait Provisioner {
    /// Fails with a human readable reason when `dbname` cannot be used.
    fn validate_name(&self, dbname: &str) -> Result<()>;

    fn provision(&self, request: &ProvisionRequest) -> Result<()>;
}

/// Wikitext back-reference to a request queue entry.
pub fn requested_link(id: impl std::fmt::Display) -> String {
    format!("[[Special:RequestWikiQueue/{id}|Requested]]")
}

/// Provisioner that records created wikis in `cw_wikis`.
pub struct SqliteWikiManager<'a> {
    connection: &'a Connection,
    suffix: String,
    clock: &'a dyn Clock,
}

impl<'a> SqliteWikiManager<'a> {
    pub fn new(connection: &'a Connection, suffix: impl Into<String>, clock: &'a dyn Clock) -> Self {
        Self {
            connection,
            suffix: suffix.into(),
            clock,
        }
    }

    pub fn exists(&self, dbname: &str) -> Result<bool> {
        let found: Option<i64> = self
            .connection
            .query_row(
                "SELECT 1 FROM cw_wikis WHERE wiki_dbname = ?1",
                [dbname],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("failed to look up wiki {dbname}"))?;
        Ok(found.is_some())
    }
}

impl Provisioner for SqliteWikiManager<'_> {
    fn validate_name(&self, dbname: &str) -> Result<()> {
        if self.exists(dbname)? {
            bail!("database {dbname} already exists");
        }
        if dbname.is_empty() || !dbname.ends_with(&self.suffix) || dbname == self.suffix {
            bail!(
                "database name {dbname:?} must be a name followed by the suffix {:?}",
                self.suffix
            );
        }
        if !dbname
            .chars()
            .all(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit())
        {
            bail!("database name {dbname:?} may only contain lowercase letters and digits");
        }
        Ok(())
    }

    fn provision(&self, request: &ProvisionRequest) -> Result<()> {
        let inserted = self
            .connection
            .execute(
                "INSERT OR IGNORE INTO cw_wikis (
                    wiki_dbname,
                    wiki_sitename,
                    wiki_language,
                    wiki_private,
                    wiki_category,
                    wiki_creator,
                    wiki_requester,
                    wiki_reason,
                    wiki_creation
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    request.dbname,
                    request.sitename,
                    request.language,
                    request.private,
                    request.category,
                    request.creator,
                    request.requester,
                    request.reason,
                    format_mw_timestamp(self.clock.now()),
                ],
            )
            .with_context(|| format!("failed to create wiki {}", request.dbname))?;
        if inserted == 0 {
            bail!("database {} already exists", request.dbname);
        }
        tracing::info!(
            dbname = %request.dbname,
            creator = %request.creator,
            "created wiki"
        );
        Ok(())
    }
}
