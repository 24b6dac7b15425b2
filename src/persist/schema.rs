//! Database schema initialization.

use anyhow::{Context, Result};
use sqlx::SqlitePool;

/// Apply the schema DDL. Every statement is idempotent, so this runs
/// unconditionally on open.
pub async fn init_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        -- One row per message the remote has ever reported for an account.
        --
        -- history_id is the cursor value attached to the last successful
        -- metadata fetch, bias-encoded into signed range. NULL means the
        -- row needs a refresh: either no fetch has succeeded yet, or the
        -- remote reported a change that invalidated the snapshot.
        --
        -- size_estimate is set on the first successful fetch and is never
        -- set back to NULL afterwards.
        CREATE TABLE IF NOT EXISTS messages (
            account TEXT NOT NULL,
            perm_id TEXT NOT NULL,
            thread_id TEXT NOT NULL,
            history_id INTEGER,
            size_estimate INTEGER,
            PRIMARY KEY (account, perm_id)
        );

        -- Rows needing refresh are the phase-two work queue.
        CREATE INDEX IF NOT EXISTS idx_messages_needs_refresh
            ON messages(account) WHERE history_id IS NULL;
        "#,
    )
    .execute(pool)
    .await
    .context("Failed to create messages table")?;

    sqlx::query(
        r#"
        -- Label identifiers known for an account. display_name and type are
        -- filled in only when a label listing has run; bare rows created to
        -- satisfy the junction table's foreign key are fine.
        CREATE TABLE IF NOT EXISTS labels (
            account TEXT NOT NULL,
            label_id TEXT NOT NULL,
            display_name TEXT,
            type TEXT CHECK (type IN (NULL, 'system', 'user')),
            PRIMARY KEY (account, label_id)
        );

        -- Junction of messages to their current labels. Rewritten as a set
        -- on every header update.
        CREATE TABLE IF NOT EXISTS message_labels (
            account TEXT NOT NULL,
            perm_id TEXT NOT NULL,
            label_id TEXT NOT NULL,
            location TEXT CHECK (location IN ('local', 'remote', 'synchronized')),
            PRIMARY KEY (account, label_id, perm_id),
            FOREIGN KEY (account, perm_id) REFERENCES messages (account, perm_id),
            FOREIGN KEY (account, label_id) REFERENCES labels (account, label_id)
        );

        CREATE INDEX IF NOT EXISTS idx_message_labels_message
            ON message_labels(account, perm_id);
        "#,
    )
    .execute(pool)
    .await
    .context("Failed to create label tables")?;

    sqlx::query(
        r#"
        -- Every committed history cursor for an account, bias-encoded so
        -- that integer order matches unsigned domain order. The maximum is
        -- the latest confirmed synchronization point.
        CREATE TABLE IF NOT EXISTS history (
            account TEXT NOT NULL,
            history_id INTEGER NOT NULL,
            PRIMARY KEY (account, history_id)
        );
        "#,
    )
    .execute(pool)
    .await
    .context("Failed to create history table")?;

    Ok(())
}
