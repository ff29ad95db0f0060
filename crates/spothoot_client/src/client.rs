//! Connection proxy: one WebSocket, many outstanding calls.
//!
//! Every outbound request carries a fresh `request_id`. Inbound envelopes
//! whose id matches a pending call resolve that call; everything else is
//! published on the local event bus under its `action`.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_util::{SinkExt, Stream, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message};

use crate::config::Config;
use crate::events::{EventBus, Subscription, SERVICE_READY};
use crate::messages::{
    CreateQuizRequest, InboundEnvelope, LoginRequest, OutboundEnvelope, ReplyData, SessionRecord,
    SetUserRequest,
};
use crate::registry::PendingCalls;
use crate::storage::{SessionStore, StorageError, SESSION_KEY};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("transport error: {0}")]
    Transport(#[from] tungstenite::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("malformed message: {0}")]
    MalformedMessage(String),
    #[error("not connected")]
    NotConnected,
    #[error("already connected")]
    AlreadyConnected,
    #[error("connection closed")]
    Disconnected,
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Knobs for session persistence.
#[derive(Debug, Clone)]
pub struct ProxyOptions {
    /// Storage key the session record is mirrored under.
    pub session_key: String,
    /// Also forget the in-memory session when the server rejects a restored one.
    /// Off by default: only the persisted copy is cleared.
    pub reset_session_on_rejection: bool,
}

impl Default for ProxyOptions {
    fn default() -> Self {
        Self {
            session_key: SESSION_KEY.to_string(),
            reset_session_on_rejection: false,
        }
    }
}

impl From<&Config> for ProxyOptions {
    fn from(c: &Config) -> Self {
        Self {
            session_key: c
                .session
                .storage_key
                .clone()
                .unwrap_or_else(|| SESSION_KEY.to_string()),
            reset_session_on_rejection: c.session.reset_on_rejection,
        }
    }
}

/// Handle for one outstanding call. Resolves with the reply's `data`.
///
/// There is no timeout: if the server never answers, this never completes.
#[derive(Debug)]
pub struct PendingReply {
    request_id: u64,
    rx: oneshot::Receiver<InboundEnvelope>,
}

impl PendingReply {
    pub fn request_id(&self) -> u64 {
        self.request_id
    }
}

impl Future for PendingReply {
    type Output = Result<ReplyData, ClientError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|res| match res {
            Ok(envelope) => Ok(ReplyData::from_value(envelope.data)),
            Err(_) => Err(ClientError::Disconnected),
        })
    }
}

/// The `setUser` call issued for a restored session, awaiting its verdict.
struct PendingRestore {
    request_id: u64,
    record: SessionRecord,
}

struct State {
    calls: PendingCalls,
    session: SessionRecord,
    ready: bool,
    opened: bool,
    outbound: Option<mpsc::UnboundedSender<String>>,
    restore: Option<PendingRestore>,
}

impl State {
    /// Register a call and queue its frame; the id order equals the wire order.
    fn send(&mut self, action: &str, data: Option<&Value>) -> Result<PendingReply, ClientError> {
        let outbound = match &self.outbound {
            Some(tx) => tx,
            None if self.opened => return Err(ClientError::Disconnected),
            None => return Err(ClientError::NotConnected),
        };
        let (request_id, rx) = self.calls.register();
        let sent = serde_json::to_string(&OutboundEnvelope::new(action, request_id, data))
            .map_err(ClientError::from)
            .and_then(|text| outbound.send(text).map_err(|_| ClientError::Disconnected));
        if let Err(e) = sent {
            self.calls.take(request_id);
            return Err(e);
        }
        tracing::debug!(action, request_id, "invoke");
        Ok(PendingReply { request_id, rx })
    }
}

struct Shared {
    state: Mutex<State>,
    events: EventBus,
    store: Arc<dyn SessionStore>,
    options: ProxyOptions,
    reader: Mutex<Option<JoinHandle<Result<(), ClientError>>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

/// Cheap to clone; all clones share one connection.
#[derive(Clone)]
pub struct Proxy {
    shared: Arc<Shared>,
}

impl Proxy {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self::with_options(store, ProxyOptions::default())
    }

    pub fn with_options(store: Arc<dyn SessionStore>, options: ProxyOptions) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    calls: PendingCalls::new(),
                    session: SessionRecord::empty(),
                    ready: false,
                    opened: false,
                    outbound: None,
                    restore: None,
                }),
                events: EventBus::new(),
                store,
                options,
                reader: Mutex::new(None),
                writer: Mutex::new(None),
            }),
        }
    }

    /// Open the WebSocket at `url` (e.g. `ws://localhost:8080/SpotHoot/api`).
    ///
    /// Subscribe to [`SERVICE_READY`] before calling this to observe readiness.
    /// A proxy connects once; a second call fails with `AlreadyConnected`.
    pub async fn connect(&self, url: &str) -> Result<(), ClientError> {
        if self.shared.state.lock().opened {
            return Err(ClientError::AlreadyConnected);
        }
        let (ws_stream, _) = tokio_tungstenite::connect_async(url).await?;
        tracing::info!(url, "connected");
        let (mut sink, stream) = ws_stream.split();

        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        self.attach(tx)?;

        let writer = tokio::spawn(async move {
            while let Some(text) = rx.recv().await {
                if let Err(e) = sink.send(Message::Text(text)).await {
                    tracing::warn!(error = %e, "send failed; writer stopping");
                    break;
                }
            }
            let _ = sink.close().await;
        });
        *self.shared.writer.lock() = Some(writer);

        let proxy = self.clone();
        let reader = tokio::spawn(async move { proxy.read_loop(stream).await });
        *self.shared.reader.lock() = Some(reader);

        self.on_open();
        Ok(())
    }

    /// Wait until the connection's reader stops. A malformed inbound frame
    /// surfaces here as `MalformedMessage`. Only the first caller gets the result.
    pub async fn closed(&self) -> Result<(), ClientError> {
        let handle = self.shared.reader.lock().take();
        match handle {
            Some(h) => h.await.unwrap_or(Err(ClientError::Disconnected)),
            None => Err(ClientError::NotConnected),
        }
    }

    /// Stop accepting calls, flush every queued frame and close the socket.
    /// Later calls fail with `Disconnected`.
    pub async fn shutdown(&self) {
        drop(self.shared.state.lock().outbound.take());
        let writer = self.shared.writer.lock().take();
        if let Some(writer) = writer {
            if let Err(e) = writer.await {
                tracing::warn!(error = %e, "writer task failed");
            }
        }
        tracing::info!("shut down");
    }

    /// Install the single outbound channel.
    pub(crate) fn attach(&self, outbound: mpsc::UnboundedSender<String>) -> Result<(), ClientError> {
        let mut state = self.shared.state.lock();
        if state.opened {
            return Err(ClientError::AlreadyConnected);
        }
        state.opened = true;
        state.outbound = Some(outbound);
        Ok(())
    }

    /// Transport is open: mark ready, start session restore, announce readiness.
    pub(crate) fn on_open(&self) {
        self.shared.state.lock().ready = true;
        tracing::info!("service ready");
        if let Err(e) = self.restore_session() {
            tracing::warn!(error = %e, "session restore failed");
        }
        self.shared
            .events
            .publish(SERVICE_READY, &InboundEnvelope::local_event(SERVICE_READY));
    }

    fn restore_session(&self) -> Result<(), ClientError> {
        let key = &self.shared.options.session_key;
        let Some(stored) = self.shared.store.get(key)?.filter(|s| !s.is_empty()) else {
            return Ok(());
        };
        let record = match SessionRecord::from_json(&stored) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(error = %e, "stored session unreadable; not restoring");
                return Ok(());
            }
        };
        if record.is_empty() {
            return Ok(());
        }
        let payload = serde_json::to_value(SetUserRequest { id: record.id() })?;

        // Registered and marked under one lock so the verdict cannot slip past dispatch.
        let mut state = self.shared.state.lock();
        state.session = record.clone();
        let pending = state.send("setUser", Some(&payload))?;
        tracing::debug!(request_id = pending.request_id(), "restoring session");
        state.restore = Some(PendingRestore {
            request_id: pending.request_id(),
            record,
        });
        Ok(())
    }

    /// Apply the `setUser` verdict in dispatch order, ahead of any later reply.
    fn finish_restore(&self, restore: PendingRestore, reply: ReplyData) {
        if reply.is_truthy() {
            tracing::info!("stored session accepted");
            return;
        }
        let mut state = self.shared.state.lock();
        if state.session != restore.record {
            tracing::debug!("session replaced since restore; keeping it");
            return;
        }
        tracing::warn!("server rejected stored session");
        if let Err(e) = self.shared.store.set(&self.shared.options.session_key, "") {
            tracing::warn!(error = %e, "failed to clear stored session");
        }
        if self.shared.options.reset_session_on_rejection {
            state.session = SessionRecord::empty();
        }
    }

    async fn read_loop<S>(&self, mut stream: S) -> Result<(), ClientError>
    where
        S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
    {
        while let Some(item) = stream.next().await {
            let text = match item? {
                Message::Text(t) => t,
                Message::Close(_) => break,
                _ => continue,
            };
            if let Err(e) = self.dispatch(&text) {
                tracing::error!(error = %e, "inbound frame rejected; closing reader");
                return Err(e);
            }
        }
        tracing::info!("connection closed");
        Ok(())
    }

    /// Route one inbound text frame to its waiting call, or publish it.
    pub(crate) fn dispatch(&self, text: &str) -> Result<(), ClientError> {
        let envelope = InboundEnvelope::from_text(text)
            .map_err(|e| ClientError::MalformedMessage(e.to_string()))?;

        // Removed under the lock before resolving, so a reply resolves at most once.
        let (waiter, restore) = {
            let mut state = self.shared.state.lock();
            let taken = envelope
                .request_id
                .and_then(|id| state.calls.take(id).map(|tx| (id, tx)));
            match taken {
                Some((id, tx)) => match state.restore.take() {
                    Some(r) if r.request_id == id => (None, Some(r)),
                    other => {
                        state.restore = other;
                        (Some(tx), None)
                    }
                },
                None => (None, None),
            }
        };

        if let Some(restore) = restore {
            self.finish_restore(restore, ReplyData::from_value(envelope.data));
            return Ok(());
        }

        match waiter {
            Some(tx) => {
                tracing::debug!(request_id = ?envelope.request_id, "reply");
                if tx.send(envelope).is_err() {
                    tracing::debug!("reply dropped; caller went away");
                }
            }
            None => {
                tracing::debug!(action = %envelope.action, "event");
                self.shared.events.publish(&envelope.action, &envelope);
            }
        }
        Ok(())
    }

    /// Send `action` with optional `data`; the returned handle resolves with the reply.
    ///
    /// The request is on the wire before this returns.
    pub fn invoke(&self, action: &str, data: Option<Value>) -> Result<PendingReply, ClientError> {
        self.shared.state.lock().send(action, data.as_ref())
    }

    fn invoke_with<T: Serialize>(&self, action: &str, payload: &T) -> Result<PendingReply, ClientError> {
        self.invoke(action, Some(serde_json::to_value(payload)?))
    }

    pub fn subscribe(&self, topic: &str) -> Subscription {
        self.shared.events.subscribe(topic)
    }

    pub fn unsubscribe(&self, subscription: &Subscription) -> bool {
        self.shared.events.unsubscribe(subscription)
    }

    pub fn is_ready(&self) -> bool {
        self.shared.state.lock().ready
    }

    pub fn is_logged_in(&self) -> bool {
        self.shared.state.lock().session.is_logged_in()
    }

    /// Current session record, or an empty one when logged out. Never touches the socket.
    pub fn user(&self) -> SessionRecord {
        let state = self.shared.state.lock();
        if state.session.is_logged_in() {
            state.session.clone()
        } else {
            SessionRecord::empty()
        }
    }

    /// Calls still waiting for a reply.
    pub fn pending_calls(&self) -> usize {
        self.shared.state.lock().calls.len()
    }

    /// Exchange an OAuth `code` for a user; the result becomes the session.
    pub async fn login(&self, code: &str) -> Result<SessionRecord, ClientError> {
        let reply = self.invoke_with("login", &LoginRequest { code })?.await?;
        let record = SessionRecord::from_reply(reply);
        if !record.is_logged_in() {
            tracing::warn!("login reply carried no user; session unchanged");
            return Ok(record);
        }
        self.shared.state.lock().session = record.clone();
        self.shared
            .store
            .set(&self.shared.options.session_key, &record.to_json()?)?;
        tracing::info!(name = ?record.name(), "logged in");
        Ok(record)
    }

    /// Forget the session locally and tell the server; the reply is not awaited.
    pub fn logout(&self) -> Result<(), ClientError> {
        self.shared.store.set(&self.shared.options.session_key, "")?;
        self.shared.state.lock().session = SessionRecord::empty();
        self.invoke("logout", None)?;
        tracing::info!("logged out");
        Ok(())
    }

    pub async fn get_login_url(&self) -> Result<String, ClientError> {
        let reply = self.invoke("getLoginURL", None)?.await?;
        Ok(match reply.as_str() {
            Some(url) => url.to_string(),
            None => reply.into_value().to_string(),
        })
    }

    pub async fn get_users(&self) -> Result<ReplyData, ClientError> {
        self.invoke("getUsers", None)?.await
    }

    pub async fn get_playlists(&self) -> Result<ReplyData, ClientError> {
        self.invoke("getPlaylists", None)?.await
    }

    pub async fn create_quiz(
        &self,
        user_ids: &[i64],
        playlist_id: &str,
        nbr_of_songs: u32,
    ) -> Result<ReplyData, ClientError> {
        let req = CreateQuizRequest {
            users: user_ids,
            playlist: playlist_id,
            nbr_of_songs,
        };
        self.invoke_with("createQuiz", &req)?.await
    }
}
