use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::context::{evict_oldest_pairs, overflow_rows, ContextStore};
use crate::types::{Role, StoreStats, Turn, TurnContent};

/// Set restrictive file permissions (0600) on the database and WAL files.
#[cfg(unix)]
fn set_db_file_permissions(db_path: &str) {
    use std::os::unix::fs::PermissionsExt;
    let mode = std::fs::Permissions::from_mode(0o600);
    if let Err(e) = std::fs::set_permissions(db_path, mode.clone()) {
        warn!("Failed to set permissions on {}: {}", db_path, e);
    }
    for suffix in &["-wal", "-shm"] {
        let path = format!("{}{}", db_path, suffix);
        if std::path::Path::new(&path).exists() {
            if let Err(e) = std::fs::set_permissions(&path, mode.clone()) {
                warn!("Failed to set permissions on {}: {}", path, e);
            }
        }
    }
}

#[cfg(not(unix))]
fn set_db_file_permissions(_db_path: &str) {}

/// Append-only SQLite log of turns keyed by conversation id, fronted by a
/// per-conversation working-memory cache.
///
/// The cache is hydrated from the log on first touch and kept in lockstep
/// with it afterwards, so an `append` is always visible to the next
/// `get_recent` on the same conversation.
pub struct SqliteContextStore {
    pool: SqlitePool,
    working_memory: RwLock<HashMap<i64, VecDeque<Turn>>>,
    cap: usize,
}

impl SqliteContextStore {
    pub async fn new(db_path: &str, cap: usize) -> anyhow::Result<Self> {
        let opts = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(opts)
            .await?;

        set_db_file_permissions(db_path);

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS turns (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                conversation_id INTEGER NOT NULL,
                role TEXT NOT NULL,
                content TEXT,
                created_at TEXT NOT NULL
            )",
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_turns_conversation ON turns(conversation_id, id)",
        )
        .execute(&pool)
        .await?;

        Ok(Self {
            pool,
            working_memory: RwLock::new(HashMap::new()),
            cap,
        })
    }

    /// Load the most recent `cap` turns for a conversation from the log,
    /// oldest first.
    async fn hydrate(&self, conversation_id: i64) -> anyhow::Result<VecDeque<Turn>> {
        let rows = sqlx::query(
            "SELECT role, content, created_at FROM turns
             WHERE conversation_id = ? ORDER BY id DESC LIMIT ?",
        )
        .bind(conversation_id)
        .bind(self.cap as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut deque = VecDeque::with_capacity(rows.len());
        // Rows arrive newest-first; push_front restores chronological order.
        for row in rows {
            let role: String = row.get("role");
            let content: Option<String> = row.get("content");
            let created_at: String = row.get("created_at");

            let role: Role = role
                .parse()
                .map_err(|e: String| anyhow::anyhow!("corrupt turn row: {}", e))?;
            let created_at = DateTime::parse_from_rfc3339(&created_at)
                .map(|t| t.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now());

            deque.push_front(Turn {
                role,
                content: TurnContent::Text(content.unwrap_or_default()),
                created_at,
            });
        }
        Ok(deque)
    }
}

#[async_trait]
impl ContextStore for SqliteContextStore {
    async fn get_recent(&self, conversation_id: i64, limit: usize) -> anyhow::Result<Vec<Turn>> {
        {
            let wm = self.working_memory.read().await;
            if let Some(deque) = wm.get(&conversation_id) {
                let skip = deque.len().saturating_sub(limit);
                return Ok(deque.iter().skip(skip).cloned().collect());
            }
        }

        // Cold start: hydrate from the log and cache the result.
        let deque = self.hydrate(conversation_id).await?;
        debug!(
            conversation_id,
            turns = deque.len(),
            "Hydrated conversation from database"
        );
        let skip = deque.len().saturating_sub(limit);
        let result = deque.iter().skip(skip).cloned().collect();

        let mut wm = self.working_memory.write().await;
        wm.insert(conversation_id, deque);
        Ok(result)
    }

    async fn append(&self, conversation_id: i64, turn: &Turn) -> anyhow::Result<()> {
        // Persist first. Image blobs never reach the log; only the text of a
        // multimodal payload survives.
        sqlx::query(
            "INSERT INTO turns (conversation_id, role, content, created_at)
             VALUES (?, ?, ?, ?)",
        )
        .bind(conversation_id)
        .bind(turn.role.as_str())
        .bind(turn.content.persisted_text())
        .bind(turn.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        // Keep the log bounded: drop oldest rows in whole pairs past the cap.
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM turns WHERE conversation_id = ?")
                .bind(conversation_id)
                .fetch_one(&self.pool)
                .await?;
        let to_delete = overflow_rows(count as u64, self.cap);
        if to_delete > 0 {
            sqlx::query(
                "DELETE FROM turns WHERE id IN (
                    SELECT id FROM turns WHERE conversation_id = ?
                    ORDER BY id ASC LIMIT ?
                )",
            )
            .bind(conversation_id)
            .bind(to_delete as i64)
            .execute(&self.pool)
            .await?;
        }

        // Mirror into working memory with the same pair eviction rule.
        let mut wm = self.working_memory.write().await;
        let deque = wm.entry(conversation_id).or_default();
        deque.push_back(Turn {
            role: turn.role,
            content: TurnContent::Text(turn.content.persisted_text()),
            created_at: turn.created_at,
        });
        let evicted = evict_oldest_pairs(deque, self.cap);
        debug!(
            conversation_id,
            role = turn.role.as_str(),
            len = deque.len(),
            evicted,
            "Appended turn"
        );
        Ok(())
    }

    async fn clear(&self, conversation_id: i64) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM turns WHERE conversation_id = ?")
            .bind(conversation_id)
            .execute(&self.pool)
            .await?;

        // Emptied, not forgotten: the conversation keeps its cache entry.
        let mut wm = self.working_memory.write().await;
        wm.insert(conversation_id, VecDeque::new());
        Ok(())
    }

    async fn stats(&self) -> anyhow::Result<StoreStats> {
        let total_turns: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM turns")
            .fetch_one(&self.pool)
            .await?;
        let active: i64 =
            sqlx::query_scalar("SELECT COUNT(DISTINCT conversation_id) FROM turns")
                .fetch_one(&self.pool)
                .await?;

        // Cleared conversations survive only in the cache; count them too.
        let wm = self.working_memory.read().await;
        let empty_cached = wm.values().filter(|d| d.is_empty()).count() as u64;

        Ok(StoreStats {
            total_conversations: active as u64 + empty_cached,
            total_turns: total_turns as u64,
            active_conversations: active as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store_with_cap(cap: usize) -> (SqliteContextStore, tempfile::NamedTempFile) {
        let db_file = tempfile::NamedTempFile::new().unwrap();
        let store = SqliteContextStore::new(db_file.path().to_str().unwrap(), cap)
            .await
            .unwrap();
        (store, db_file)
    }

    #[tokio::test]
    async fn append_is_visible_to_next_get_recent() {
        let (store, _db) = store_with_cap(20).await;

        store.append(7, &Turn::user("hello")).await.unwrap();
        let turns = store.get_recent(7, 20).await.unwrap();
        assert_eq!(turns.len(), 1);
        assert_eq!(turns.last().unwrap().content.persisted_text(), "hello");

        store.append(7, &Turn::assistant("hi there")).await.unwrap();
        let turns = store.get_recent(7, 20).await.unwrap();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns.last().unwrap().content.persisted_text(), "hi there");
    }

    #[tokio::test]
    async fn get_recent_returns_chronological_window() {
        let (store, _db) = store_with_cap(20).await;

        for i in 0..4 {
            store.append(1, &Turn::user(format!("u{}", i))).await.unwrap();
            store
                .append(1, &Turn::assistant(format!("a{}", i)))
                .await
                .unwrap();
        }

        let turns = store.get_recent(1, 3).await.unwrap();
        assert_eq!(turns.len(), 3);
        let texts: Vec<String> = turns.iter().map(|t| t.content.persisted_text()).collect();
        assert_eq!(texts, vec!["a2", "u3", "a3"]);
    }

    #[tokio::test]
    async fn overflow_drops_oldest_pair_never_dangling_assistant() {
        let (store, _db) = store_with_cap(4).await;

        for i in 0..3 {
            store.append(1, &Turn::user(format!("u{}", i))).await.unwrap();
            store
                .append(1, &Turn::assistant(format!("a{}", i)))
                .await
                .unwrap();
        }

        let turns = store.get_recent(1, 100).await.unwrap();
        assert_eq!(turns.len(), 4);
        assert_eq!(turns[0].role, Role::User);
        assert_eq!(turns[0].content.persisted_text(), "u1");
    }

    #[tokio::test]
    async fn trimming_survives_a_cold_restart() {
        let db_file = tempfile::NamedTempFile::new().unwrap();
        let path = db_file.path().to_str().unwrap().to_string();

        {
            let store = SqliteContextStore::new(&path, 4).await.unwrap();
            for i in 0..4 {
                store.append(1, &Turn::user(format!("u{}", i))).await.unwrap();
                store
                    .append(1, &Turn::assistant(format!("a{}", i)))
                    .await
                    .unwrap();
            }
        }

        // Fresh store, cold cache: the on-disk log was trimmed too.
        let store = SqliteContextStore::new(&path, 4).await.unwrap();
        let turns = store.get_recent(1, 100).await.unwrap();
        assert_eq!(turns.len(), 4);
        assert_eq!(turns[0].role, Role::User);
        assert_eq!(turns[0].content.persisted_text(), "u2");
    }

    #[tokio::test]
    async fn clear_empties_a_conversation() {
        let (store, _db) = store_with_cap(20).await;

        store.append(5, &Turn::user("hi")).await.unwrap();
        store.append(5, &Turn::assistant("hello")).await.unwrap();
        store.clear(5).await.unwrap();

        assert!(store.get_recent(5, 20).await.unwrap().is_empty());

        // Cleared, not deleted: it still counts as a known conversation.
        let stats = store.stats().await.unwrap();
        assert_eq!(stats.total_conversations, 1);
        assert_eq!(stats.active_conversations, 0);
        assert_eq!(stats.total_turns, 0);
    }

    #[tokio::test]
    async fn conversations_are_isolated() {
        let (store, _db) = store_with_cap(20).await;

        store.append(1, &Turn::user("from one")).await.unwrap();
        store.append(2, &Turn::user("from two")).await.unwrap();

        let one = store.get_recent(1, 20).await.unwrap();
        let two = store.get_recent(2, 20).await.unwrap();
        assert_eq!(one.len(), 1);
        assert_eq!(two.len(), 1);
        assert_eq!(one[0].content.persisted_text(), "from one");
        assert_eq!(two[0].content.persisted_text(), "from two");

        store.clear(1).await.unwrap();
        assert!(store.get_recent(1, 20).await.unwrap().is_empty());
        assert_eq!(store.get_recent(2, 20).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn multimodal_turns_persist_text_only() {
        use crate::types::{ContentPart, TurnContent};
        let (store, _db) = store_with_cap(20).await;

        let turn = Turn::new(
            Role::User,
            TurnContent::Parts(vec![
                ContentPart::Text("what is this?".into()),
                ContentPart::Image {
                    media_type: "image/jpeg".into(),
                    data: "QUJD".into(),
                },
            ]),
        );
        store.append(9, &turn).await.unwrap();

        let turns = store.get_recent(9, 20).await.unwrap();
        assert_eq!(turns[0].content.persisted_text(), "what is this?");
        // The blob itself must not be in the stored text.
        assert!(!turns[0].content.persisted_text().contains("QUJD"));
    }
}
