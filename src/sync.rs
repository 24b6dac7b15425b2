//! The two-phase sync pipeline.
//!
//! Phase one (`pull_list`) refreshes the set of known message identifiers
//! and advances the history cursor, all inside a single transaction. Phase
//! two (`pull_download`) fetches content for every row flagged as needing
//! refresh, one transaction per batch, fanned out across a worker pool.
//! Either phase can be interrupted at any suspension point; the active
//! transaction rolls back and the next run converges.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::blob::BlobStore;
use crate::message::{MessageHeader, MessageId};
use crate::persist::{Db, Tx};
use crate::store::{MessageStorage, StoreError};

/// Depth of the channel between the remote enumeration and the database
/// writer in phase one.
const LIST_CHANNEL_DEPTH: usize = 1000;

/// Rows claimed per phase-two transaction. Bounds how long a single
/// mutating transaction stays open during large downloads.
const DOWNLOAD_BATCH: u32 = 1000;

/// Concurrent download workers per batch.
const DOWNLOAD_WORKERS: usize = 100;

/// The stored cursor is ahead of the server's, which means the remote
/// discarded history. Recovery would be a full re-list.
#[derive(Debug, thiserror::Error)]
#[error("stored history cursor {local} is ahead of the server's {remote}: cursor reset recovery is not implemented")]
pub struct HistoryReset {
    pub local: u64,
    pub remote: u64,
}

/// Run a complete synchronization pass: refresh the identifier list, then
/// download everything flagged for refresh.
pub async fn sync(
    store: Arc<dyn MessageStorage>,
    db: &Db,
    blobs: Arc<BlobStore>,
    account: &str,
    cancel: CancellationToken,
) -> Result<()> {
    tracing::info!("pulling the list of remote messages");
    pull_list(&store, db, account, &cancel)
        .await
        .context("Failed to refresh the message list")?;

    tracing::info!("pulling message content");
    pull_download(&store, db, &blobs, account, &cancel)
        .await
        .context("Failed to download messages")?;

    Ok(())
}

async fn pull_list(
    store: &Arc<dyn MessageStorage>,
    db: &Db,
    account: &str,
    cancel: &CancellationToken,
) -> Result<()> {
    let tx = db.begin().await?;
    let last = tx.latest_history_id(account).await?;

    let profile = store
        .get_profile()
        .await
        .context("Failed to fetch the account profile")?;

    if last == 0 {
        tracing::info!(
            "full sync to history id {} for {}",
            profile.history_id,
            profile.email_address
        );
    } else {
        tracing::info!(
            "incremental sync from {} to {} for {}",
            last,
            profile.history_id,
            profile.email_address
        );
        if last > profile.history_id {
            return Err(HistoryReset {
                local: last,
                remote: profile.history_id,
            }
            .into());
        }
        if last == profile.history_id {
            tx.commit().await?;
            return Ok(());
        }
    }

    // The cursor is written before the enumeration on purpose: if the
    // stream fails partway the whole transaction rolls back and the old
    // cursor survives; if it succeeds the cursor is already in place.
    tx.write_history_id(account, profile.history_id).await?;

    let (ids_tx, mut ids_rx) = mpsc::channel(LIST_CHANNEL_DEPTH);
    let producer = tokio::spawn({
        let store = Arc::clone(store);
        let cancel = cancel.clone();
        async move {
            let listing = async {
                if last == 0 {
                    store.list_all(ids_tx).await
                } else {
                    store.list_from(last, ids_tx).await
                }
            };
            tokio::select! {
                _ = cancel.cancelled() => Err(StoreError::Cancelled),
                res = listing => res,
            }
        }
    });

    // Drain into the open transaction on this task while the producer
    // walks the remote listing.
    let mut consumer_result: Result<()> = Ok(());
    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => {
                consumer_result = Err(anyhow!("sync cancelled"));
                break;
            }
            id = ids_rx.recv() => id,
        };
        let Some(id) = received else { break };
        if let Err(err) = tx.insert_message_id(account, &id).await {
            consumer_result = Err(err);
            break;
        }
    }
    drop(ids_rx);

    let producer_result = producer.await.context("Listing task panicked")?;

    consumer_result?;
    if let Err(err) = producer_result {
        return Err(anyhow::Error::new(err).context("Failed to enumerate messages"));
    }

    tx.commit().await
}

async fn pull_download(
    store: &Arc<dyn MessageStorage>,
    db: &Db,
    blobs: &Arc<BlobStore>,
    account: &str,
    cancel: &CancellationToken,
) -> Result<()> {
    loop {
        let tx = Arc::new(db.begin().await?);
        let ids = tx.list_updated(account, DOWNLOAD_BATCH).await?;
        let count = ids.len();

        if count > 0 {
            tracing::info!("downloading {count} updated messages");
            run_batch(store, &tx, blobs, account, cancel, ids)
                .await
                .context("Failed to pull messages")?;
        }

        let tx = Arc::try_unwrap(tx).map_err(|_| anyhow!("download transaction still shared"))?;
        tx.commit().await?;

        // A short batch means the refresh queue is drained.
        if count < DOWNLOAD_BATCH as usize {
            return Ok(());
        }
    }
}

/// Fan one batch of ids out across the worker pool. The first failure
/// cancels the rest of the batch.
async fn run_batch(
    store: &Arc<dyn MessageStorage>,
    tx: &Arc<Tx>,
    blobs: &Arc<BlobStore>,
    account: &str,
    cancel: &CancellationToken,
    ids: Vec<MessageId>,
) -> Result<()> {
    let batch_cancel = cancel.child_token();
    let (work_tx, work_rx) = mpsc::channel(DOWNLOAD_WORKERS);
    let work_rx = Arc::new(tokio::sync::Mutex::new(work_rx));

    let mut workers = JoinSet::new();
    for _ in 0..DOWNLOAD_WORKERS.min(ids.len()) {
        let store = Arc::clone(store);
        let tx = Arc::clone(tx);
        let blobs = Arc::clone(blobs);
        let account = account.to_string();
        let cancel = batch_cancel.clone();
        let work_rx = Arc::clone(&work_rx);
        workers.spawn(async move {
            loop {
                let received = {
                    let mut rx = work_rx.lock().await;
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(anyhow!("sync cancelled")),
                        id = rx.recv() => id,
                    }
                };
                let Some(id) = received else { return Ok(()) };
                handle_updated(store.as_ref(), &tx, &blobs, &account, &id)
                    .await
                    .with_context(|| format!("Failed to pull message {}", id.perm_id))?;
            }
        });
    }

    let feeder = tokio::spawn({
        let cancel = batch_cancel.clone();
        async move {
            for id in ids {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    // A send failure means every worker is gone; whatever
                    // stopped them is reported by the join loop.
                    res = work_tx.send(id) => {
                        if res.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    });

    let mut first_err: Option<anyhow::Error> = None;
    while let Some(joined) = workers.join_next().await {
        let result = joined.context("Download worker panicked")?;
        if let Err(err) = result {
            if first_err.is_none() {
                batch_cancel.cancel();
                first_err = Some(err);
            }
        }
    }
    feeder.await.context("Batch feeder panicked")?;

    match first_err {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Bring one flagged message up to date.
///
/// A body already on disk only needs its metadata refreshed, which skips
/// re-transferring content for label-only changes. Otherwise the full
/// message is fetched and the blob is written before the metadata, so a
/// crash between the two re-downloads rather than recording missing data.
async fn handle_updated(
    store: &dyn MessageStorage,
    tx: &Tx,
    blobs: &BlobStore,
    account: &str,
    id: &MessageId,
) -> Result<()> {
    if blobs.has(&id.perm_id) {
        return match store.get_message_header(&id.perm_id).await {
            Ok(hdr) => tx.update_header(account, &hdr).await,
            Err(StoreError::NotFound) => write_sentinel(tx, account, id).await,
            Err(err) => Err(anyhow::Error::new(err).context("Failed to fetch message header")),
        };
    }

    match store.get_message_full(&id.perm_id).await {
        Ok(body) => {
            tracing::debug!(
                "inserting message {} history id {} size estimate {}",
                id.perm_id,
                body.header.history_id,
                body.header.size_estimate
            );
            blobs.insert(&body)?;
            tx.update_header(account, &body.header).await
        }
        Err(StoreError::NotFound) => write_sentinel(tx, account, id).await,
        Err(err) => Err(anyhow::Error::new(err).context("Failed to fetch message")),
    }
}

/// The message is gone from the remote. A zero-cursor header keeps the row
/// out of the refresh queue; treating this as a real deletion is a future
/// extension.
async fn write_sentinel(tx: &Tx, account: &str, id: &MessageId) -> Result<()> {
    tracing::warn!(
        "message {} not found on the remote, writing zero history id",
        id.perm_id
    );
    tx.update_header(account, &MessageHeader::sentinel(id.clone()))
        .await
}
