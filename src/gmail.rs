//! Gmail REST v1 implementation of the message storage contract.
//!
//! Speaks the plain JSON API with a bearer token; token acquisition is the
//! caller's concern. Every call is charged against the owned rate limiter
//! using the documented per-call quota costs, and HTTP 429 responses are
//! retried after another trip through the limiter.

use anyhow::anyhow;
use async_trait::async_trait;
use base64::Engine;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::message::{MessageBody, MessageHeader, MessageId, Profile};
use crate::ratelimit::RateLimiter;
use crate::store::{MessageStorage, StoreError};

const BASE_URL: &str = "https://gmail.googleapis.com/gmail/v1/users/me";

/// The mailbox views this tool mirrors: inbox and sent, minus chat
/// transcripts.
const MAILBOX_QUERY: &str = "-is:chat {in:inbox in:sent}";

// Per-call quota costs, see
// https://developers.google.com/gmail/api/reference/quota
const QUOTA_UNITS_MESSAGES_GET: u32 = 5;
const QUOTA_UNITS_GET_PROFILE: u32 = 2;
const QUOTA_UNITS_HISTORY_LIST: u32 = 2;
const QUOTA_UNITS_MESSAGES_LIST: u32 = 1;

const HTTP_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

pub struct GmailStore {
    http: reqwest::Client,
    access_token: String,
    limiter: RateLimiter,
    cancel: CancellationToken,
}

impl GmailStore {
    pub fn new(
        access_token: String,
        limiter: RateLimiter,
        cancel: CancellationToken,
    ) -> Result<Self, StoreError> {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(StoreError::transport)?;
        Ok(Self {
            http,
            access_token,
            limiter,
            cancel,
        })
    }

    /// Charge `cost` tokens and issue one GET, decoding the response into
    /// `T`. Retries indefinitely on quota pushback.
    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
        cost: u32,
    ) -> Result<T, StoreError> {
        loop {
            self.limiter
                .acquire(cost, &self.cancel)
                .await
                .map_err(|_| StoreError::Cancelled)?;

            match self.try_get_json(path, query).await {
                Err(StoreError::RateLimited) => {
                    tracing::debug!("rate limited by server on {path}, retrying");
                    continue;
                }
                other => return other,
            }
        }
    }

    async fn try_get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, StoreError> {
        let response = self
            .http
            .get(format!("{BASE_URL}/{path}"))
            .bearer_auth(&self.access_token)
            .query(query)
            .send()
            .await
            .map_err(StoreError::transport)?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(StoreError::RateLimited);
        }
        if status == reqwest::StatusCode::NOT_FOUND {
            // Only a remote-reported "notFound" reason means the resource is
            // gone; anything else is a transport-level problem.
            let envelope: Option<ApiErrorEnvelope> = response.json().await.ok();
            let not_found = envelope
                .as_ref()
                .map(|e| e.error.errors.iter().any(|item| item.reason == "notFound"))
                .unwrap_or(false);
            if not_found {
                return Err(StoreError::NotFound);
            }
            return Err(StoreError::transport(anyhow!(
                "unexpected 404 from {path}: {:?}",
                envelope.map(|e| e.error.message)
            )));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StoreError::transport(anyhow!(
                "{path} failed with status {status}: {body}"
            )));
        }

        response.json().await.map_err(StoreError::transport)
    }

    /// Fetch one message at the given format, reporting chat transcripts as
    /// not found: they carry message ids but are not mail.
    async fn get_message(&self, perm_id: &str, format: &str) -> Result<GmailMessage, StoreError> {
        let msg: GmailMessage = self
            .get_json(
                &format!("messages/{perm_id}"),
                &[("format", format.to_string())],
                QUOTA_UNITS_MESSAGES_GET,
            )
            .await?;
        if is_chat(&msg.label_ids) {
            return Err(StoreError::NotFound);
        }
        Ok(msg)
    }
}

fn is_chat(label_ids: &[String]) -> bool {
    label_ids.iter().any(|label| label == "CHAT")
}

fn parse_history_id(raw: &str) -> Result<u64, StoreError> {
    raw.parse::<u64>()
        .map_err(|err| StoreError::transport(anyhow!("bad history id {raw:?}: {err}")))
}

fn header_from(msg: &GmailMessage) -> Result<MessageHeader, StoreError> {
    Ok(MessageHeader {
        id: MessageId::new(&msg.id, &msg.thread_id),
        label_ids: msg.label_ids.clone(),
        size_estimate: msg.size_estimate,
        history_id: parse_history_id(&msg.history_id)?,
    })
}

#[async_trait]
impl MessageStorage for GmailStore {
    async fn get_profile(&self) -> Result<Profile, StoreError> {
        let profile: GmailProfile = self
            .get_json("profile", &[], QUOTA_UNITS_GET_PROFILE)
            .await?;
        Ok(Profile {
            email_address: profile.email_address,
            history_id: parse_history_id(&profile.history_id)?,
        })
    }

    async fn list_all(&self, out: mpsc::Sender<MessageId>) -> Result<(), StoreError> {
        let mut page_token: Option<String> = None;
        let mut total = 0usize;
        loop {
            let mut query = vec![("q", MAILBOX_QUERY.to_string())];
            if let Some(token) = page_token.take() {
                query.push(("pageToken", token));
            }
            let page: ListMessagesResponse = self
                .get_json("messages", &query, QUOTA_UNITS_MESSAGES_LIST)
                .await?;

            total += page.messages.len();
            tracing::debug!(
                "listed page of messages; count {}; total so far {}",
                page.messages.len(),
                total
            );
            for msg in page.messages {
                out.send(MessageId::new(msg.id, msg.thread_id))
                    .await
                    .map_err(|_| StoreError::Closed)?;
            }

            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }
        tracing::info!("done listing messages; total {total}");
        Ok(())
    }

    async fn list_from(
        &self,
        history_id: u64,
        out: mpsc::Sender<MessageId>,
    ) -> Result<(), StoreError> {
        let mut page_token: Option<String> = None;
        let mut total = 0usize;
        loop {
            let mut query = vec![
                ("historyTypes", "messageAdded".to_string()),
                ("startHistoryId", history_id.to_string()),
            ];
            if let Some(token) = page_token.take() {
                query.push(("pageToken", token));
            }
            let page: ListHistoryResponse = self
                .get_json("history", &query, QUOTA_UNITS_HISTORY_LIST)
                .await?;

            total += page.history.len();
            tracing::debug!(
                "listed page of history; count {}; total so far {}",
                page.history.len(),
                total
            );
            for record in page.history {
                for added in record.messages_added {
                    out.send(MessageId::new(added.message.id, added.message.thread_id))
                        .await
                        .map_err(|_| StoreError::Closed)?;
                }
            }

            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }
        tracing::info!("done listing history; total {total}");
        Ok(())
    }

    async fn get_message_header(&self, perm_id: &str) -> Result<MessageHeader, StoreError> {
        let msg = self.get_message(perm_id, "minimal").await?;
        header_from(&msg)
    }

    async fn get_message_full(&self, perm_id: &str) -> Result<MessageBody, StoreError> {
        let msg = self.get_message(perm_id, "raw").await?;
        let header = header_from(&msg)?;
        let raw = msg
            .raw
            .as_deref()
            .ok_or_else(|| StoreError::transport(anyhow!("message {perm_id} has no raw payload")))?;
        let raw = base64::engine::general_purpose::URL_SAFE
            .decode(raw)
            .map_err(|err| StoreError::transport(anyhow!("decoding message {perm_id}: {err}")))?;
        Ok(MessageBody { header, raw })
    }
}

//
// Wire types
//

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailProfile {
    email_address: String,
    history_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListMessagesResponse {
    #[serde(default)]
    messages: Vec<IdRef>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IdRef {
    id: String,
    #[serde(default)]
    thread_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListHistoryResponse {
    #[serde(default)]
    history: Vec<HistoryRecord>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryRecord {
    #[serde(default)]
    messages_added: Vec<HistoryMessageAdded>,
}

#[derive(Debug, Deserialize)]
struct HistoryMessageAdded {
    message: IdRef,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailMessage {
    id: String,
    #[serde(default)]
    thread_id: String,
    #[serde(default)]
    label_ids: Vec<String>,
    #[serde(default)]
    size_estimate: i64,
    history_id: String,
    #[serde(default)]
    raw: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorEnvelope {
    error: ApiError,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    message: String,
    #[serde(default)]
    errors: Vec<ApiErrorItem>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorItem {
    #[serde(default)]
    reason: String,
}
