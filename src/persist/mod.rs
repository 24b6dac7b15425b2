//! SQLite metadata store for message identifiers, header snapshots, label
//! relations, and the per-account history cursor.
//!
//! This module is split into:
//! - `mod.rs` - `Db` open/close, transactions, row operations
//! - `schema.rs` - schema DDL
//!
//! All mutation happens inside an explicit transaction. The phase-two
//! download pipeline shares one transaction across many workers, so `Tx`
//! serializes statements through an internal async mutex. A `Tx` that is
//! dropped without `commit` rolls back.

mod schema;

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, Sqlite, SqliteConnection, SqlitePool, Transaction};
use tokio::sync::Mutex;

use crate::message::{MessageHeader, MessageId};

/// Small pool: one writer transaction at a time plus headroom for the odd
/// concurrent reader (another process owns read traffic).
const POOL_SIZE: u32 = 4;

/// SQLite gives up after its busy timeout when another connection holds the
/// write lock. The default 5 seconds is too short next to long-running
/// indexer processes sharing the file; use 5 minutes.
const BUSY_TIMEOUT: Duration = Duration::from_secs(300);

/// Map an unsigned 64-bit cursor into signed storage so that integer order
/// on the stored form matches unsigned order on the domain.
/// (Imagine 0..=255 mapping to -128..=127.)
pub(crate) fn ordered_to_signed(u: u64) -> i64 {
    u.wrapping_sub(1 << 63) as i64
}

/// Inverse of [`ordered_to_signed`].
pub(crate) fn ordered_to_unsigned(s: i64) -> u64 {
    (s as u64).wrapping_add(1 << 63)
}

pub struct Db {
    pool: SqlitePool,
}

impl Db {
    /// Create or open the database at `path` and apply the schema.
    pub async fn open(path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(POOL_SIZE)
            .connect_with(options)
            .await
            .with_context(|| format!("Failed to open database at {}", path.display()))?;

        schema::init_schema(&pool).await?;

        Ok(Self { pool })
    }

    #[cfg(test)]
    pub async fn open_in_memory() -> Result<Self> {
        use std::str::FromStr;

        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);

        // A single connection: every :memory: connection is its own database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .context("Failed to create in-memory connection pool")?;

        schema::init_schema(&pool).await?;

        Ok(Self { pool })
    }

    /// Start an atomic unit of work.
    pub async fn begin(&self) -> Result<Tx> {
        let tx = self
            .pool
            .begin()
            .await
            .context("Failed to begin transaction")?;
        Ok(Tx {
            inner: Mutex::new(tx),
        })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    #[cfg(test)]
    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// An open transaction. Methods take `&self` and serialize internally, so a
/// `Tx` can be shared across concurrent workers.
pub struct Tx {
    inner: Mutex<Transaction<'static, Sqlite>>,
}

impl Tx {
    /// Upsert a message identifier reported by the remote. Marks the row as
    /// needing refresh by clearing `history_id`, and drops its label
    /// junction rows; a later header update rebuilds them.
    pub async fn insert_message_id(&self, account: &str, id: &MessageId) -> Result<()> {
        let mut tx = self.inner.lock().await;

        sqlx::query(
            r#"
            INSERT INTO messages (account, perm_id, thread_id) VALUES (?, ?, ?)
            ON CONFLICT (account, perm_id)
            DO UPDATE SET thread_id = excluded.thread_id, history_id = NULL
            "#,
        )
        .bind(account)
        .bind(&id.perm_id)
        .bind(&id.thread_id)
        .execute(&mut **tx)
        .await
        .context("Failed to upsert message id")?;

        sqlx::query("DELETE FROM message_labels WHERE account = ? AND perm_id = ?")
            .bind(account)
            .bind(&id.perm_id)
            .execute(&mut **tx)
            .await
            .context("Failed to clear message labels")?;

        Ok(())
    }

    /// Record a fetched header: cursor, size estimate, and the exact label
    /// set. Clears the refresh flag.
    pub async fn update_header(&self, account: &str, hdr: &MessageHeader) -> Result<()> {
        let mut tx = self.inner.lock().await;

        sqlx::query(
            "UPDATE messages SET history_id = ?, size_estimate = ? \
             WHERE account = ? AND perm_id = ?",
        )
        .bind(ordered_to_signed(hdr.history_id))
        .bind(hdr.size_estimate)
        .bind(account)
        .bind(&hdr.id.perm_id)
        .execute(&mut **tx)
        .await
        .context("Failed to update message header")?;

        sqlx::query("DELETE FROM message_labels WHERE account = ? AND perm_id = ?")
            .bind(account)
            .bind(&hdr.id.perm_id)
            .execute(&mut **tx)
            .await
            .context("Failed to clear message labels")?;

        for label_id in &hdr.label_ids {
            // The junction's foreign key wants the label row to exist even
            // if no label listing has populated its display name yet.
            sqlx::query("INSERT OR IGNORE INTO labels (account, label_id) VALUES (?, ?)")
                .bind(account)
                .bind(label_id)
                .execute(&mut **tx)
                .await
                .context("Failed to insert label")?;

            sqlx::query(
                "INSERT INTO message_labels (account, perm_id, label_id, location) \
                 VALUES (?, ?, ?, 'remote')",
            )
            .bind(account)
            .bind(&hdr.id.perm_id)
            .bind(label_id)
            .execute(&mut **tx)
            .await
            .context("Failed to insert message label")?;
        }

        Ok(())
    }

    /// Up to `limit` messages whose refresh flag is set. Order is
    /// unspecified but stable within the transaction.
    pub async fn list_updated(&self, account: &str, limit: u32) -> Result<Vec<MessageId>> {
        let mut tx = self.inner.lock().await;

        let rows = sqlx::query(
            "SELECT perm_id, thread_id FROM messages \
             WHERE account = ? AND history_id IS NULL LIMIT ?",
        )
        .bind(account)
        .bind(i64::from(limit))
        .fetch_all(&mut **tx)
        .await
        .context("Failed to list messages needing refresh")?;

        Ok(rows
            .into_iter()
            .map(|row| MessageId {
                perm_id: row.get("perm_id"),
                thread_id: row.get("thread_id"),
            })
            .collect())
    }

    /// The highest committed cursor for the account, or 0 before the first
    /// sync.
    pub async fn latest_history_id(&self, account: &str) -> Result<u64> {
        let mut tx = self.inner.lock().await;
        latest_history_id_on(&mut tx, account).await
    }

    /// Record a newly confirmed cursor. The cursor is monotonic: a value at
    /// or below the current maximum is a programming error and is rejected.
    pub async fn write_history_id(&self, account: &str, history_id: u64) -> Result<()> {
        let mut tx = self.inner.lock().await;

        let latest = latest_history_id_on(&mut tx, account).await?;
        if history_id <= latest {
            bail!("attempt to decrease the latest history id ({history_id} <= {latest})");
        }

        sqlx::query("INSERT INTO history (account, history_id) VALUES (?, ?)")
            .bind(account)
            .bind(ordered_to_signed(history_id))
            .execute(&mut **tx)
            .await
            .context("Failed to insert history id")?;

        Ok(())
    }

    pub async fn commit(self) -> Result<()> {
        self.inner
            .into_inner()
            .commit()
            .await
            .context("Failed to commit transaction")
    }

    #[allow(dead_code)]
    pub async fn rollback(self) -> Result<()> {
        self.inner
            .into_inner()
            .rollback()
            .await
            .context("Failed to roll back transaction")
    }
}

async fn latest_history_id_on(
    tx: &mut Transaction<'static, Sqlite>,
    account: &str,
) -> Result<u64> {
    let conn: &mut SqliteConnection = &mut *tx;
    let max: Option<i64> = sqlx::query_scalar("SELECT MAX(history_id) FROM history WHERE account = ?")
        .bind(account)
        .fetch_one(conn)
        .await
        .context("Failed to read latest history id")?;
    Ok(max.map(ordered_to_unsigned).unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;

    const ACCOUNT: &str = "test@example.com";

    #[test]
    fn test_ordered_encoding() {
        let cases: [(u64, i64); 5] = [
            (0, i64::MIN),
            (u64::MAX, i64::MAX),
            ((i64::MAX as u64) + 1, 0),
            (1, i64::MIN + 1),
            (100, i64::MIN + 100),
        ];
        for (u, s) in cases {
            assert_eq!(ordered_to_signed(u), s, "encoding {u:#x}");
            assert_eq!(ordered_to_unsigned(s), u, "decoding {s:#x}");
        }
    }

    #[test]
    fn test_ordered_encoding_preserves_order() {
        let samples: [u64; 7] = [
            0,
            1,
            100,
            i64::MAX as u64,
            (i64::MAX as u64) + 1,
            u64::MAX - 1,
            u64::MAX,
        ];
        for &a in &samples {
            for &b in &samples {
                assert_eq!(
                    a < b,
                    ordered_to_signed(a) < ordered_to_signed(b),
                    "order of {a} and {b}"
                );
            }
        }
    }

    #[tokio::test]
    async fn test_begin_commit_and_rollback() {
        let db = Db::open_in_memory().await.unwrap();
        db.begin().await.unwrap().commit().await.unwrap();
        db.begin().await.unwrap().rollback().await.unwrap();
    }

    #[tokio::test]
    async fn test_insert_message_id_is_idempotent() {
        let db = Db::open_in_memory().await.unwrap();

        let tx = db.begin().await.unwrap();
        tx.insert_message_id(ACCOUNT, &MessageId::new("m1", "t1"))
            .await
            .unwrap();
        tx.insert_message_id(ACCOUNT, &MessageId::new("m2", "t2"))
            .await
            .unwrap();
        tx.insert_message_id(ACCOUNT, &MessageId::new("m1", "t1b"))
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let tx = db.begin().await.unwrap();
        let mut updated = tx.list_updated(ACCOUNT, 100).await.unwrap();
        tx.rollback().await.unwrap();

        updated.sort_by(|a, b| a.perm_id.cmp(&b.perm_id));
        assert_eq!(updated.len(), 2);
        assert_eq!(updated[0].perm_id, "m1");
        // thread_id comes from the latest insert.
        assert_eq!(updated[0].thread_id, "t1b");
        assert_eq!(updated[1].perm_id, "m2");
    }

    #[tokio::test]
    async fn test_update_header_clears_refresh_flag() {
        let db = Db::open_in_memory().await.unwrap();
        let id = MessageId::new("m1", "t1");

        let tx = db.begin().await.unwrap();
        tx.insert_message_id(ACCOUNT, &id).await.unwrap();
        tx.commit().await.unwrap();

        let tx = db.begin().await.unwrap();
        assert_eq!(tx.list_updated(ACCOUNT, 100).await.unwrap().len(), 1);
        tx.update_header(
            ACCOUNT,
            &MessageHeader {
                id: id.clone(),
                label_ids: vec!["INBOX".into()],
                size_estimate: 1234,
                history_id: 42,
            },
        )
        .await
        .unwrap();
        assert!(tx.list_updated(ACCOUNT, 100).await.unwrap().is_empty());
        tx.commit().await.unwrap();

        // A later remote change marks the row for refresh again.
        let tx = db.begin().await.unwrap();
        tx.insert_message_id(ACCOUNT, &id).await.unwrap();
        assert_eq!(tx.list_updated(ACCOUNT, 100).await.unwrap().len(), 1);
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_update_header_rewrites_label_set() {
        let db = Db::open_in_memory().await.unwrap();
        let id = MessageId::new("m1", "t1");

        let tx = db.begin().await.unwrap();
        tx.insert_message_id(ACCOUNT, &id).await.unwrap();
        tx.update_header(
            ACCOUNT,
            &MessageHeader {
                id: id.clone(),
                label_ids: vec!["INBOX".into(), "IMPORTANT".into()],
                size_estimate: 10,
                history_id: 5,
            },
        )
        .await
        .unwrap();
        tx.update_header(
            ACCOUNT,
            &MessageHeader {
                id: id.clone(),
                label_ids: vec!["IMPORTANT".into(), "STARRED".into()],
                size_estimate: 10,
                history_id: 6,
            },
        )
        .await
        .unwrap();
        tx.commit().await.unwrap();

        let rows = sqlx::query(
            "SELECT label_id FROM message_labels \
             WHERE account = ? AND perm_id = ? ORDER BY label_id",
        )
        .bind(ACCOUNT)
        .bind("m1")
        .fetch_all(db.pool())
        .await
        .unwrap();
        let labels: Vec<String> = rows.iter().map(|r| r.get("label_id")).collect();
        assert_eq!(labels, vec!["IMPORTANT".to_string(), "STARRED".to_string()]);
    }

    #[tokio::test]
    async fn test_history_id_round_trip() {
        let db = Db::open_in_memory().await.unwrap();

        let tx = db.begin().await.unwrap();
        assert_eq!(tx.latest_history_id(ACCOUNT).await.unwrap(), 0);
        tx.write_history_id(ACCOUNT, 12345).await.unwrap();
        tx.commit().await.unwrap();

        let tx = db.begin().await.unwrap();
        assert_eq!(tx.latest_history_id(ACCOUNT).await.unwrap(), 12345);
        tx.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn test_history_id_is_per_account() {
        let db = Db::open_in_memory().await.unwrap();

        let tx = db.begin().await.unwrap();
        tx.write_history_id("a@example.com", 100).await.unwrap();
        tx.write_history_id("b@example.com", 7).await.unwrap();
        tx.commit().await.unwrap();

        let tx = db.begin().await.unwrap();
        assert_eq!(tx.latest_history_id("a@example.com").await.unwrap(), 100);
        assert_eq!(tx.latest_history_id("b@example.com").await.unwrap(), 7);
        tx.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn test_write_history_id_rejects_nonincreasing() {
        let db = Db::open_in_memory().await.unwrap();

        let tx = db.begin().await.unwrap();
        tx.write_history_id(ACCOUNT, 100).await.unwrap();
        tx.commit().await.unwrap();

        let tx = db.begin().await.unwrap();
        assert!(tx.write_history_id(ACCOUNT, 50).await.is_err());
        assert!(tx.write_history_id(ACCOUNT, 100).await.is_err());
        // The failed write left no side effects to commit.
        tx.rollback().await.unwrap();

        let tx = db.begin().await.unwrap();
        assert_eq!(tx.latest_history_id(ACCOUNT).await.unwrap(), 100);
        tx.write_history_id(ACCOUNT, 101).await.unwrap();
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_history_id_full_range() {
        let db = Db::open_in_memory().await.unwrap();

        let tx = db.begin().await.unwrap();
        tx.write_history_id(ACCOUNT, 1).await.unwrap();
        tx.write_history_id(ACCOUNT, i64::MAX as u64).await.unwrap();
        tx.write_history_id(ACCOUNT, (i64::MAX as u64) + 1)
            .await
            .unwrap();
        tx.write_history_id(ACCOUNT, u64::MAX).await.unwrap();
        tx.commit().await.unwrap();

        let tx = db.begin().await.unwrap();
        assert_eq!(tx.latest_history_id(ACCOUNT).await.unwrap(), u64::MAX);
        tx.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn test_dropped_tx_rolls_back() {
        let db = Db::open_in_memory().await.unwrap();

        {
            let tx = db.begin().await.unwrap();
            tx.insert_message_id(ACCOUNT, &MessageId::new("m1", "t1"))
                .await
                .unwrap();
            tx.write_history_id(ACCOUNT, 9).await.unwrap();
            // Dropped without commit.
        }

        let tx = db.begin().await.unwrap();
        assert!(tx.list_updated(ACCOUNT, 100).await.unwrap().is_empty());
        assert_eq!(tx.latest_history_id(ACCOUNT).await.unwrap(), 0);
        tx.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn test_list_updated_honors_limit() {
        let db = Db::open_in_memory().await.unwrap();

        let tx = db.begin().await.unwrap();
        for i in 0..5 {
            tx.insert_message_id(ACCOUNT, &MessageId::new(format!("m{i}"), "t"))
                .await
                .unwrap();
        }
        tx.commit().await.unwrap();

        let tx = db.begin().await.unwrap();
        assert_eq!(tx.list_updated(ACCOUNT, 3).await.unwrap().len(), 3);
        assert_eq!(tx.list_updated(ACCOUNT, 100).await.unwrap().len(), 5);
        tx.rollback().await.unwrap();
    }
}
