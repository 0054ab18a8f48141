//! HTTP adapter for the managed data service.
//!
//! REST reads and writes live under `rest/v1/`, the push channel is a
//! server-sent-events stream at `realtime/v1/stream`. Requests carry the
//! project `apikey` header and, once signed in, a bearer token.

use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
};

use async_trait::async_trait;
use futures_util::StreamExt;
use parking_lot::Mutex;
use reqwest::{Client, RequestBuilder, Response, StatusCode, header};
use serde::Serialize;
use shared::models::{
    ApiError, ChangeEvent, ChangeKind, EventFilter, FeedFrame, MessageDraft, ReadReceiptAck,
    Record, Scope, SenderProfile, StreamErrorEvent,
};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;
use uuid::Uuid;

use super::{
    Backend, BackendError, BackendResult, FeedSubscription, SubscriptionId,
    sse::{SseDecoder, SseEvent},
};

const RECORDS_PATH: &str = "rest/v1/records";
const MESSAGES_PATH: &str = "rest/v1/messages";
const MARK_READ_PATH: &str = "rest/v1/rpc/mark_conversation_read";
const PROFILES_PATH: &str = "rest/v1/profiles/";
const STREAM_PATH: &str = "realtime/v1/stream";

#[derive(Serialize)]
struct MarkReadRequest {
    conversation_id: Uuid,
    reader_id: Uuid,
}

/// Backend over the service's REST API and SSE stream.
pub struct HttpBackend {
    client: Client,
    base: Url,
    api_key: Option<String>,
    access_token: Option<String>,
    streams: Mutex<HashMap<SubscriptionId, CancellationToken>>,
    next_subscription: AtomicU64,
}

impl HttpBackend {
    /// `base` must end with a slash so relative routes join beneath it.
    #[must_use]
    pub fn new(base: Url, api_key: Option<String>) -> Self {
        Self {
            client: Client::new(),
            base,
            api_key,
            access_token: None,
            streams: Mutex::new(HashMap::new()),
            next_subscription: AtomicU64::new(1),
        }
    }

    /// Sends `token` as a bearer token on every request.
    #[must_use]
    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    fn url(&self, path: &str) -> BackendResult<Url> {
        self.base
            .join(path)
            .map_err(|err| BackendError::Decode(format!("invalid route `{path}`: {err}")))
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        let request = match &self.api_key {
            Some(key) => request.header("apikey", key),
            None => request,
        };
        match self.access_token.as_ref().or(self.api_key.as_ref()) {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder) -> BackendResult<Response> {
        let response = self.authorize(request).send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let error = match serde_json::from_str::<ApiError>(&body) {
            Ok(error) => error,
            Err(_) if body.is_empty() => ApiError::new(status.to_string()),
            Err(_) => ApiError::new(body),
        };
        Err(match status {
            StatusCode::CONFLICT => BackendError::Conflict(error.to_string()),
            StatusCode::NOT_FOUND => BackendError::NotFound(error.to_string()),
            StatusCode::SERVICE_UNAVAILABLE => BackendError::Unavailable(error.to_string()),
            _ => BackendError::Api {
                status: status.as_u16(),
                error,
            },
        })
    }

    fn spawn_reader(
        response: Response,
        id: SubscriptionId,
        tx: mpsc::UnboundedSender<FeedFrame>,
        cancel: CancellationToken,
    ) {
        tokio::spawn(async move {
            let mut body = response.bytes_stream();
            let mut decoder = SseDecoder::new();
            loop {
                let chunk = tokio::select! {
                    () = cancel.cancelled() => break,
                    chunk = body.next() => chunk,
                };
                match chunk {
                    Some(Ok(bytes)) => {
                        for event in decoder.push(&bytes) {
                            if let Some(frame) = decode_frame(&event)
                                && tx.send(frame).is_err()
                            {
                                return;
                            }
                        }
                    }
                    Some(Err(err)) => {
                        warn!(subscription = %id, error = %err, "push stream read failed");
                        break;
                    }
                    None => break,
                }
            }
            debug!(subscription = %id, "push stream reader finished");
        });
    }
}

/// Maps one SSE event to a feed frame. Undecodable change events become an
/// error frame so the gap is repaired by a reconcile fetch.
fn decode_frame(event: &SseEvent) -> Option<FeedFrame> {
    let name = event.event.as_deref()?;
    match name {
        "ack" => Some(FeedFrame::Ack),
        "heartbeat" => Some(FeedFrame::Heartbeat),
        "error" => Some(FeedFrame::Error(
            serde_json::from_str::<StreamErrorEvent>(&event.data).unwrap_or_else(|_| {
                StreamErrorEvent {
                    code: "unknown".to_string(),
                    message: event.data.clone(),
                }
            }),
        )),
        other => {
            let kind = other.parse::<ChangeKind>().ok()?;
            Some(match serde_json::from_str::<Record>(&event.data) {
                Ok(record) => FeedFrame::Change(ChangeEvent { kind, record }),
                Err(err) => FeedFrame::Error(StreamErrorEvent {
                    code: "decode".to_string(),
                    message: format!("invalid {other} payload: {err}"),
                }),
            })
        }
    }
}

#[async_trait]
impl Backend for HttpBackend {
    async fn subscribe(
        &self,
        scope: &Scope,
        filter: EventFilter,
    ) -> BackendResult<FeedSubscription> {
        let mut url = self.url(STREAM_PATH)?;
        url.query_pairs_mut()
            .append_pair("scope", &scope.to_string())
            .append_pair("events", &filter.to_string());

        let response = self
            .send(
                self.client
                    .get(url)
                    .header(header::ACCEPT, "text/event-stream"),
            )
            .await?;

        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::SeqCst));
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        self.streams.lock().insert(id, cancel.clone());
        Self::spawn_reader(response, id, tx, cancel);
        debug!(subscription = %id, scope = %scope, "push stream opened");

        Ok(FeedSubscription {
            id,
            frames: Box::pin(UnboundedReceiverStream::new(rx)),
        })
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        if let Some(cancel) = self.streams.lock().remove(&id) {
            cancel.cancel();
            debug!(subscription = %id, "push stream released");
        }
    }

    async fn fetch_records(&self, scope: &Scope) -> BackendResult<Vec<Record>> {
        let mut url = self.url(RECORDS_PATH)?;
        url.query_pairs_mut()
            .append_pair("scope", &scope.to_string())
            .append_pair("order", "created_at.asc,id.asc");

        let response = self.send(self.client.get(url)).await?;
        response
            .json::<Vec<Record>>()
            .await
            .map_err(|err| BackendError::Decode(err.to_string()))
    }

    async fn write_read_receipt(
        &self,
        conversation_id: Uuid,
        reader_id: Uuid,
    ) -> BackendResult<ReadReceiptAck> {
        let url = self.url(MARK_READ_PATH)?;
        let body = MarkReadRequest {
            conversation_id,
            reader_id,
        };
        let response = self.send(self.client.post(url).json(&body)).await?;
        response
            .json::<ReadReceiptAck>()
            .await
            .map_err(|err| BackendError::Decode(err.to_string()))
    }

    async fn post_message(&self, draft: &MessageDraft) -> BackendResult<Record> {
        let url = self.url(MESSAGES_PATH)?;
        let response = self
            .send(
                self.client
                    .post(url)
                    .header("Prefer", "return=representation")
                    .json(draft),
            )
            .await?;
        response
            .json::<Record>()
            .await
            .map_err(|err| BackendError::Decode(err.to_string()))
    }

    async fn fetch_profile(&self, user_id: Uuid) -> BackendResult<SenderProfile> {
        let url = self.url(&format!("{PROFILES_PATH}{user_id}"))?;
        let response = self.send(self.client.get(url)).await?;
        response
            .json::<SenderProfile>()
            .await
            .map_err(|err| BackendError::Decode(err.to_string()))
    }
}

impl std::fmt::Debug for HttpBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpBackend")
            .field("base", &self.base.as_str())
            .field("api_key", &self.api_key.is_some())
            .field("streams", &self.streams.lock().len())
            .finish_non_exhaustive()
    }
}
