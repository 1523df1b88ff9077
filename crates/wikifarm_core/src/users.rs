use anyhow::{Context, Result, bail};
use rusqlite::{Connection, OptionalExtension};

use crate::request::{User, UserId};

/// Resolves user identities for requesters and comment authors.
pub trait UserDirectory {
    fn lookup_by_id(&self, id: UserId) -> Result<User>;

    fn lookup_by_name(&self, name: &str) -> Result<Option<User>>;
}

pub struct SqliteUserDirectory<'a> {
    connection: &'a Connection,
}

impl<'a> SqliteUserDirectory<'a> {
    pub fn new(connection: &'a Connection) -> Self {
        Self { connection }
    }

    /// Look up `name`, registering it first if it is unknown.
    pub fn ensure_user(&self, name: &str) -> Result<User> {
        let name = normalize_user_name(name);
        if name.is_empty() {
            bail!("user name cannot be empty");
        }
        let inserted = self
            .connection
            .execute(
                "INSERT OR IGNORE INTO farm_users (user_name) VALUES (?1)",
                [&name],
            )
            .with_context(|| format!("failed to register user {name}"))?;
        if inserted > 0 {
            tracing::debug!(user = %name, "registered user");
        }
        self.lookup_by_name(&name)?
            .ok_or_else(|| anyhow::anyhow!("user {name} vanished after registration"))
    }
}

impl UserDirectory for SqliteUserDirectory<'_> {
    fn lookup_by_id(&self, id: UserId) -> Result<User> {
        let name: Option<String> = self
            .connection
            .query_row(
                "SELECT user_name FROM farm_users WHERE user_id = ?1",
                [id.0],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("failed to load user {id}"))?;
        match name {
            Some(name) => Ok(User { id, name }),
            None => bail!("unknown user id {id}"),
        }
    }

    fn lookup_by_name(&self, name: &str) -> Result<Option<User>> {
        let name = normalize_user_name(name);
        self.connection
            .query_row(
                "SELECT user_id, user_name FROM farm_users WHERE user_name = ?1",
                [&name],
                |row| {
                    Ok(User {
                        id: UserId(row.get(0)?),
                        name: row.get(1)?,
                    })
                },
            )
            .optional()
            .with_context(|| format!("failed to look up user {name}"))
    }
}

/// MediaWiki user names use spaces, not underscores, and start upper case.
fn normalize_user_name(name: &str) -> String {
    let trimmed = name.replace('_', " ");
    let trimmed = trimmed.trim();
    let mut chars = trimmed.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
