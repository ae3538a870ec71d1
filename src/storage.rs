use std::collections::HashSet;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteRow, SqliteSynchronous};
use sqlx::{Pool, Row, Sqlite};
use tracing::{debug, error};
use uuid::Uuid;

use crate::session::{derive_preview, derive_title, ChatMessage, ChatSession, ScreenshotEntry};

/// Full replacement state for one session row.
#[derive(Debug, Clone, Default)]
pub struct SessionUpsert {
    pub existing_id: Option<String>,
    pub messages: Vec<ChatMessage>,
    pub is_pinned: bool,
}

/// Session persistence. Implementations log storage failures and degrade to
/// empty results instead of returning them.
#[async_trait]
pub trait SessionRepository: Send + Sync {
    /// Writes the whole row keyed by `existing_id` (or a freshly minted id).
    /// Returns `None` when there are no messages to save.
    async fn upsert_session(&self, draft: SessionUpsert) -> Option<String>;
    async fn list_sessions(&self) -> Vec<ChatSession>;
    async fn get_session(&self, id: &str) -> Option<ChatSession>;
    async fn delete_sessions(&self, ids: &HashSet<String>);
    async fn toggle_pin(&self, id: &str);

    /// History search over titles and previews, in `list_sessions` order.
    async fn search_sessions(&self, query: &str) -> Vec<ChatSession> {
        let mut sessions = self.list_sessions().await;
        sessions.retain(|s| s.matches(query));
        sessions
    }
}

#[async_trait]
pub trait ScreenshotRepository: Send + Sync {
    async fn upsert_screenshot(&self, entry: &ScreenshotEntry);
    async fn list_screenshots(&self) -> Vec<ScreenshotEntry>;
    async fn get_screenshot(&self, id: &str) -> Option<ScreenshotEntry>;
}

#[derive(Clone)]
pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

impl SqliteStore {
    pub async fn initialize(database_url: Option<String>) -> anyhow::Result<Self> {
        let url = match database_url {
            Some(u) => u,
            None => resolve_default_db_url()?,
        };
        let options = url
            .parse::<SqliteConnectOptions>()?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full);
        let pool = Pool::<Sqlite>::connect_with(options).await?;
        sqlx::query("PRAGMA busy_timeout = 5000;").execute(&pool).await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        debug!(%url, "session store ready");
        Ok(Self { pool })
    }

    #[cfg(test)]
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    /// Raw INSERT OR REPLACE of a fully built session.
    pub async fn save(&self, session: &ChatSession) -> anyhow::Result<()> {
        let messages_json = serde_json::to_string(&session.messages)?;
        sqlx::query(
            "INSERT OR REPLACE INTO chat_sessions (id, title, lastMessage, timestamp, messages, isPinned) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(&session.id)
        .bind(&session.title)
        .bind(&session.last_message)
        .bind(session.timestamp.timestamp_millis())
        .bind(messages_json)
        .bind(i64::from(session.is_pinned))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn try_list_sessions(&self) -> anyhow::Result<Vec<ChatSession>> {
        let rows = sqlx::query(
            "SELECT id, title, lastMessage, timestamp, messages, isPinned FROM chat_sessions \
             ORDER BY isPinned DESC, timestamp DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(session_from_row).collect()
    }

    async fn try_get_session(&self, id: &str) -> anyhow::Result<Option<ChatSession>> {
        let row = sqlx::query(
            "SELECT id, title, lastMessage, timestamp, messages, isPinned FROM chat_sessions WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(session_from_row).transpose()
    }

    async fn try_delete_sessions(&self, ids: &HashSet<String>) -> anyhow::Result<u64> {
        let mut tx = self.pool.begin().await?;
        let mut removed = 0;
        for id in ids {
            let res = sqlx::query("DELETE FROM chat_sessions WHERE id = ?1")
                .bind(id)
                .execute(&mut *tx)
                .await?;
            removed += res.rows_affected();
        }
        tx.commit().await?;
        Ok(removed)
    }

    async fn try_toggle_pin(&self, id: &str) -> anyhow::Result<bool> {
        let res = sqlx::query("UPDATE chat_sessions SET isPinned = 1 - isPinned WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() > 0)
    }

    async fn try_upsert_screenshot(&self, entry: &ScreenshotEntry) -> anyhow::Result<()> {
        sqlx::query("INSERT OR REPLACE INTO screenshots (id, localUri, summary, timestamp) VALUES (?1, ?2, ?3, ?4)")
            .bind(&entry.id)
            .bind(&entry.local_uri)
            .bind(&entry.summary)
            .bind(entry.timestamp.timestamp_millis())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn try_list_screenshots(&self) -> anyhow::Result<Vec<ScreenshotEntry>> {
        let rows = sqlx::query("SELECT id, localUri, summary, timestamp FROM screenshots ORDER BY timestamp DESC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(screenshot_from_row).collect()
    }

    async fn try_get_screenshot(&self, id: &str) -> anyhow::Result<Option<ScreenshotEntry>> {
        let row = sqlx::query("SELECT id, localUri, summary, timestamp FROM screenshots WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(screenshot_from_row).transpose()
    }
}

fn resolve_default_db_url() -> anyhow::Result<String> {
    let base = std::env::var("XDG_DATA_HOME").ok().map(PathBuf::from).unwrap_or_else(|| {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".into());
        PathBuf::from(home).join(".local").join("share")
    });
    let dir = base.join("lens_companion");
    std::fs::create_dir_all(&dir)?;
    let path = dir.join("lens_companion.db");
    Ok(format!("sqlite://{}", path.to_string_lossy()))
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or_else(Utc::now)
}

fn session_from_row(r: &SqliteRow) -> anyhow::Result<ChatSession> {
    let messages_json: String = r.try_get("messages")?;
    let messages: Vec<ChatMessage> = serde_json::from_str(&messages_json)?;
    Ok(ChatSession {
        id: r.try_get("id")?,
        title: r.try_get("title")?,
        last_message: r.try_get("lastMessage")?,
        timestamp: from_millis(r.try_get("timestamp")?),
        messages,
        is_pinned: r.try_get::<i64, _>("isPinned")? != 0,
    })
}

fn screenshot_from_row(r: &SqliteRow) -> anyhow::Result<ScreenshotEntry> {
    Ok(ScreenshotEntry {
        id: r.try_get("id")?,
        local_uri: r.try_get("localUri")?,
        summary: r.try_get("summary")?,
        timestamp: from_millis(r.try_get("timestamp")?),
    })
}

#[async_trait]
impl SessionRepository for SqliteStore {
    async fn upsert_session(&self, draft: SessionUpsert) -> Option<String> {
        if draft.messages.is_empty() {
            return None;
        }
        let id = draft.existing_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let session = ChatSession {
            title: derive_title(&draft.messages),
            last_message: derive_preview(&draft.messages),
            timestamp: Utc::now(),
            id: id.clone(),
            messages: draft.messages,
            is_pinned: draft.is_pinned,
        };
        match self.save(&session).await {
            Ok(()) => {
                metrics::counter!("lens_session_upserts_total").increment(1);
                debug!(session_id = %id, messages = session.messages.len(), "chat session saved");
            }
            Err(e) => error!(session_id = %id, error = %e, "failed to save chat session"),
        }
        Some(id)
    }

    async fn list_sessions(&self) -> Vec<ChatSession> {
        self.try_list_sessions().await.unwrap_or_else(|e| {
            error!(error = %e, "failed to fetch chat history");
            Vec::new()
        })
    }

    async fn get_session(&self, id: &str) -> Option<ChatSession> {
        self.try_get_session(id).await.unwrap_or_else(|e| {
            error!(session_id = %id, error = %e, "failed to get chat session");
            None
        })
    }

    async fn delete_sessions(&self, ids: &HashSet<String>) {
        if ids.is_empty() {
            return;
        }
        match self.try_delete_sessions(ids).await {
            Ok(n) => debug!(requested = ids.len(), removed = n, "chat sessions deleted"),
            Err(e) => error!(error = %e, "failed to delete chat sessions"),
        }
    }

    async fn toggle_pin(&self, id: &str) {
        match self.try_toggle_pin(id).await {
            Ok(true) => debug!(session_id = %id, "pin toggled"),
            Ok(false) => debug!(session_id = %id, "pin toggle ignored for unknown session"),
            Err(e) => error!(session_id = %id, error = %e, "failed to toggle pin"),
        }
    }
}

#[async_trait]
impl ScreenshotRepository for SqliteStore {
    async fn upsert_screenshot(&self, entry: &ScreenshotEntry) {
        if let Err(e) = self.try_upsert_screenshot(entry).await {
            error!(screenshot_id = %entry.id, error = %e, "failed to save screenshot summary");
        }
    }

    async fn list_screenshots(&self) -> Vec<ScreenshotEntry> {
        self.try_list_screenshots().await.unwrap_or_else(|e| {
            error!(error = %e, "failed to fetch screenshots");
            Vec::new()
        })
    }

    async fn get_screenshot(&self, id: &str) -> Option<ScreenshotEntry> {
        self.try_get_screenshot(id).await.unwrap_or_else(|e| {
            error!(screenshot_id = %id, error = %e, "failed to get screenshot");
            None
        })
    }
}
