use chrono::{DateTime, Utc};
use convo_core::{ChatMessage, Role, SessionSummary, Tenant};
use rusqlite::{params, Connection};
use std::path::Path;
use thiserror::Error;

pub const CHAT_SCHEMA_VERSION: i64 = 1;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("timestamp parse error: {0}")]
    Timestamp(String),
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
    #[error("no database connection is configured")]
    NoDatabase,
}

/// One row of the export query. `role` is already normalized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportRow {
    pub id: i64,
    pub session_id: String,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// Tenant-scoped store over the `chat_histories` table. The table is
/// written by the external chat pipeline; this side is read-mostly.
pub struct ChatStore {
    conn: Connection,
}

impl ChatStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    pub fn schema_version(&self) -> Result<i64, StorageError> {
        Ok(self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    pub fn migrate(&self) -> Result<(), StorageError> {
        let current = self.schema_version()?;
        if current > CHAT_SCHEMA_VERSION {
            return Err(StorageError::UnsupportedSchemaVersion {
                found: current,
                supported: CHAT_SCHEMA_VERSION,
            });
        }

        if current < 1 {
            let sql = include_str!("../migrations/0001_chat_histories.sql");
            self.conn.execute_batch(sql)?;
            self.conn
                .execute("PRAGMA user_version = 1", [])
                .map(|_| ())?;
        }

        Ok(())
    }

    /// Most recent message per distinct session, newest session first.
    /// A non-positive or missing limit falls back to the default of 50.
    pub fn session_summaries(&self, limit: Option<i64>) -> Result<Vec<SessionSummary>, StorageError> {
        let limit = match limit {
            Some(value) if value > 0 => value,
            _ => 50,
        };
        let mut stmt = self.conn.prepare(
            "
            WITH ranked AS (
                SELECT
                    session_id,
                    message,
                    created_at,
                    ROW_NUMBER() OVER (
                        PARTITION BY session_id
                        ORDER BY created_at DESC
                    ) AS row_number
                FROM chat_histories
            )
            SELECT
                session_id,
                COALESCE(json_extract(message, '$.content'), '') AS last_message,
                created_at AS last_message_at
            FROM ranked
            WHERE row_number = 1
            ORDER BY created_at DESC
            LIMIT ?1
            ",
        )?;
        let rows = stmt.query_map(params![limit], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut sessions = Vec::new();
        for row in rows {
            let (session_id, last_message, last_message_at) = row?;
            sessions.push(SessionSummary {
                session_id,
                last_message,
                last_message_at: parse_ts(&last_message_at)?,
            });
        }
        Ok(sessions)
    }

    /// Full thread for one session, ascending by creation time.
    pub fn messages_for_session(&self, session_id: &str) -> Result<Vec<ChatMessage>, StorageError> {
        let mut stmt = self.conn.prepare(
            "
            SELECT
                id,
                session_id,
                json_extract(message, '$.type') AS role,
                COALESCE(json_extract(message, '$.content'), '') AS content,
                created_at
            FROM chat_histories
            WHERE session_id = ?1
            ORDER BY created_at ASC
            ",
        )?;
        let rows = stmt.query_map(params![session_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;

        let mut messages = Vec::new();
        for row in rows {
            let (id, session_id, role, content, created_at) = row?;
            messages.push(ChatMessage {
                id,
                session_id,
                role: Role::from_stored(role.as_deref()),
                content,
                created_at: parse_ts(&created_at)?,
            });
        }
        Ok(messages)
    }

    /// Rows for CSV export: one session when `session_id` is given, the
    /// whole tenant otherwise. Ordered session then time, both ascending.
    pub fn export_rows(&self, session_id: Option<&str>) -> Result<Vec<ExportRow>, StorageError> {
        let base = "
            SELECT
                id,
                session_id,
                json_extract(message, '$.type') AS role,
                COALESCE(json_extract(message, '$.content'), '') AS content,
                created_at
            FROM chat_histories
        ";
        let order = " ORDER BY session_id ASC, created_at ASC";

        let map_row = |row: &rusqlite::Row<'_>| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
            ))
        };

        let mut collected = Vec::new();
        match session_id {
            Some(session_id) => {
                let sql = format!("{base} WHERE session_id = ?1 {order}");
                let mut stmt = self.conn.prepare(&sql)?;
                let rows = stmt.query_map(params![session_id], map_row)?;
                for row in rows {
                    collected.push(row?);
                }
            }
            None => {
                let sql = format!("{base} {order}");
                let mut stmt = self.conn.prepare(&sql)?;
                let rows = stmt.query_map([], map_row)?;
                for row in rows {
                    collected.push(row?);
                }
            }
        }

        let mut export = Vec::new();
        for (id, session_id, role, content, created_at) in collected {
            export.push(ExportRow {
                id,
                session_id,
                role: Role::from_stored(role.as_deref()),
                content,
                created_at: parse_ts(&created_at)?,
            });
        }
        Ok(export)
    }

    /// Insert one raw message row. Production writes come from the external
    /// chat pipeline; this is for tests and demo seeding.
    pub fn insert_message(
        &self,
        session_id: &str,
        role: Option<&str>,
        content: &str,
        created_at: DateTime<Utc>,
    ) -> Result<i64, StorageError> {
        let message = match role {
            Some(role) => serde_json::json!({ "type": role, "content": content }),
            None => serde_json::json!({ "content": content }),
        };
        self.conn.execute(
            "INSERT INTO chat_histories (session_id, message, created_at) VALUES (?1, ?2, ?3)",
            params![session_id, message.to_string(), created_at.to_rfc3339()],
        )?;
        Ok(self.conn.last_insert_rowid())
    }
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| StorageError::Timestamp(format!("{raw}: {err}")))
}

/// Per-tenant stores. A tenant whose database is not configured is served
/// from the other tenant's store, matching the original connection-pool
/// fallback; neither configured is a hard error.
pub struct TenantStores {
    al_azhar: Option<ChatStore>,
    lestari: Option<ChatStore>,
}

impl TenantStores {
    pub fn new(al_azhar: Option<ChatStore>, lestari: Option<ChatStore>) -> Result<Self, StorageError> {
        if al_azhar.is_none() && lestari.is_none() {
            return Err(StorageError::NoDatabase);
        }
        Ok(Self { al_azhar, lestari })
    }

    pub fn store(&self, tenant: Tenant) -> Result<&ChatStore, StorageError> {
        let (primary, fallback) = match tenant {
            Tenant::AlAzhar => (&self.al_azhar, &self.lestari),
            Tenant::Lestari => (&self.lestari, &self.al_azhar),
        };
        primary
            .as_ref()
            .or(fallback.as_ref())
            .ok_or(StorageError::NoDatabase)
    }
}
