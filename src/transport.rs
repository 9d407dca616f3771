//! The transport session: one media+control connection at a time.
//!
//! The handshake has two phases, in order: acquire the local audio source,
//! mint a short-lived credential over REST, then negotiate the realtime
//! WebSocket connection with it. A bounded wait is applied to the open
//! confirmation so a missing signal never hangs the connect attempt.
//!
//! Once connected, three pump tasks own the socket: outbound control frames,
//! inbound frames (audio peeled off to the sink, everything else delivered as
//! ordered control events), and the microphone feed. Teardown aborts all
//! three and is idempotent.

use crate::audio::{self, AudioSink, AudioSource};
use crate::config::{ApiConfig, SessionConfig};
use crate::error::SessionError;
use crate::protocol;
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tracing::{error, info, warn};

/// How long to wait for the remote open confirmation before proceeding
/// anyway.
pub const HANDSHAKE_OPEN_WAIT: Duration = Duration::from_secs(2);

/// Local audio in, remote audio out. Both stay behind traits; device access
/// is the caller's concern.
pub struct AudioIo {
    pub source: Box<dyn AudioSource>,
    pub sink: Arc<dyn AudioSink>,
}

/// Typed transport events, delivered in arrival order over one channel per
/// connection.
#[derive(Debug)]
pub enum TransportEvent {
    /// The control channel reported open.
    Open,
    /// One inbound control frame, raw JSON.
    Control(String),
    /// The connection ended, cleanly or not.
    Closed,
}

/// One live connection. `send` is fire-and-forget: a frame written while the
/// channel is down is logged and dropped, never an error the caller sees.
pub struct TransportSession {
    outbound: mpsc::Sender<String>,
    events: StdMutex<Option<mpsc::Receiver<TransportEvent>>>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
    source: StdMutex<Option<Box<dyn AudioSource>>>,
    closed: AtomicBool,
}

impl TransportSession {
    pub(crate) fn new(
        outbound: mpsc::Sender<String>,
        events: mpsc::Receiver<TransportEvent>,
        tasks: Vec<JoinHandle<()>>,
        source: Option<Box<dyn AudioSource>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            outbound,
            events: StdMutex::new(Some(events)),
            tasks: StdMutex::new(tasks),
            source: StdMutex::new(source),
            closed: AtomicBool::new(false),
        })
    }

    /// Writes one frame to the control channel. Callers must not assume
    /// delivery.
    pub async fn send(&self, frame: String) {
        if self.closed.load(Ordering::SeqCst) {
            warn!("control channel closed; dropping outbound frame");
            return;
        }
        if self.outbound.send(frame).await.is_err() {
            warn!("control channel not writable; dropping outbound frame");
        }
    }

    /// Hands out the ordered event stream. Yields once per connection.
    pub(crate) fn take_events(&self) -> Option<mpsc::Receiver<TransportEvent>> {
        self.events.lock().expect("events lock").take()
    }

    /// Stops local media, closes the control channel and the underlying
    /// connection. Safe to call repeatedly or on a never-connected session.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for task in self.tasks.lock().expect("tasks lock").drain(..) {
            task.abort();
        }
        if let Some(mut source) = self.source.lock().expect("source lock").take() {
            source.stop();
        }
        info!("transport session closed");
    }
}

impl Drop for TransportSession {
    fn drop(&mut self) {
        self.close();
    }
}

/// Returns a short-lived access token for the handshake. The orchestrator
/// never caches or persists it.
#[async_trait]
pub trait EphemeralTokenProvider: Send + Sync {
    async fn mint(&self, config: &SessionConfig) -> Result<String>;
}

/// Mints the token against the provider's session endpoint.
pub struct RestTokenProvider {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl RestTokenProvider {
    pub fn new(api: &ApiConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: api.rest_base_url.clone(),
            api_key: api.api_key.clone(),
        }
    }
}

#[async_trait]
impl EphemeralTokenProvider for RestTokenProvider {
    async fn mint(&self, config: &SessionConfig) -> Result<String> {
        let url = format!("{}/realtime/sessions", self.base_url.trim_end_matches('/'));
        let resp = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({
                "model": config.model,
                "voice": config.voice,
            }))
            .send()
            .await
            .context("session mint request failed")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("session mint returned {status}: {body}");
        }
        let body: Value = resp.json().await.context("session mint body not JSON")?;
        extract_client_secret(&body).context("session mint body had no client secret")
    }
}

fn extract_client_secret(body: &Value) -> Option<String> {
    body.get("client_secret")?
        .get("value")?
        .as_str()
        .map(|s| s.to_string())
}

/// Builds one live `TransportSession` per call. The production implementation
/// talks to the realtime service; tests substitute their own.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        config: &SessionConfig,
        audio: AudioIo,
    ) -> Result<Arc<TransportSession>, SessionError>;
}

/// Connector for the OpenAI realtime service.
pub struct OpenAiConnector {
    tokens: Arc<dyn EphemeralTokenProvider>,
    ws_url: String,
}

impl OpenAiConnector {
    pub fn new(api: &ApiConfig, tokens: Arc<dyn EphemeralTokenProvider>) -> Self {
        Self {
            tokens,
            ws_url: api.realtime_ws_url.clone(),
        }
    }
}

#[async_trait]
impl Connector for OpenAiConnector {
    async fn connect(
        &self,
        config: &SessionConfig,
        mut audio: AudioIo,
    ) -> Result<Arc<TransportSession>, SessionError> {
        // Phase 1: local media. Failing here must not touch the network.
        let mut frames = audio
            .source
            .open()
            .map_err(|e| SessionError::MediaAcquisition(e.to_string()))?;

        // Phase 2: credential exchange, then connection negotiation.
        let token = match self.tokens.mint(config).await {
            Ok(token) => token,
            Err(e) => {
                audio.source.stop();
                return Err(SessionError::Handshake(e.to_string()));
            }
        };
        let ws = match negotiate(&self.ws_url, &config.model, &token).await {
            Ok(ws) => ws,
            Err(e) => {
                audio.source.stop();
                return Err(SessionError::Handshake(e.to_string()));
            }
        };
        info!(model = %config.model, "realtime connection negotiated");

        let (mut ws_tx, mut ws_rx) = ws.split();
        let (out_tx, mut out_rx) = mpsc::channel::<String>(64);
        let (ev_tx, ev_rx) = mpsc::channel::<TransportEvent>(256);
        let (open_tx, open_rx) = oneshot::channel::<()>();

        let writer = tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if let Err(e) = ws_tx.send(WsMessage::Text(frame.into())).await {
                    warn!(error = %e, "control frame write failed");
                    break;
                }
            }
        });

        let sink = audio.sink.clone();
        let reader_ev_tx = ev_tx.clone();
        let reader = tokio::spawn(async move {
            let mut open_tx = Some(open_tx);
            while let Some(message) = ws_rx.next().await {
                match message {
                    Ok(WsMessage::Text(text)) => {
                        match inbound_kind(&text) {
                            InboundKind::AudioDelta(delta) => {
                                sink.play(audio::decode_base64_pcm16(&delta));
                                continue;
                            }
                            InboundKind::SessionCreated => {
                                if let Some(tx) = open_tx.take() {
                                    let _ = tx.send(());
                                }
                                if reader_ev_tx.send(TransportEvent::Open).await.is_err() {
                                    break;
                                }
                                continue;
                            }
                            InboundKind::Other => {}
                        }
                        if reader_ev_tx
                            .send(TransportEvent::Control(text.to_string()))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Ok(WsMessage::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        error!(error = %e, "realtime stream error");
                        break;
                    }
                }
            }
            let _ = reader_ev_tx.send(TransportEvent::Closed).await;
        });

        let mic_out = out_tx.clone();
        let mic = tokio::spawn(async move {
            while let Some(frame) = frames.recv().await {
                let encoded = protocol::encode_audio_append(&audio::encode_pcm16_base64(&frame));
                if mic_out.send(encoded).await.is_err() {
                    break;
                }
            }
        });

        // The open confirmation may never fire; proceed after a bounded wait
        // rather than hanging the attempt.
        match tokio::time::timeout(HANDSHAKE_OPEN_WAIT, open_rx).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => warn!("connection ended before the open confirmation"),
            Err(_) => warn!("open confirmation not received in time; proceeding"),
        }

        Ok(TransportSession::new(
            out_tx,
            ev_rx,
            vec![writer, reader, mic],
            Some(audio.source),
        ))
    }
}

async fn negotiate(
    ws_url: &str,
    model: &str,
    token: &str,
) -> Result<
    tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
> {
    let mut request = format!("{ws_url}?model={model}")
        .into_client_request()
        .context("invalid realtime URL")?;
    request.headers_mut().insert(
        "Authorization",
        format!("Bearer {token}")
            .parse()
            .context("token not header-safe")?,
    );
    request
        .headers_mut()
        .insert("OpenAI-Beta", "realtime=v1".parse().expect("static header"));
    let (ws, _) = connect_async(request)
        .await
        .context("realtime WebSocket connect failed")?;
    Ok(ws)
}

enum InboundKind {
    AudioDelta(String),
    SessionCreated,
    Other,
}

/// Cheap dispatch of an inbound frame before the codec sees it: audio deltas
/// bypass the control path entirely, and the open confirmation is a
/// transport-level signal.
fn inbound_kind(raw: &str) -> InboundKind {
    let Ok(v) = serde_json::from_str::<Value>(raw) else {
        return InboundKind::Other;
    };
    match v.get("type").and_then(Value::as_str) {
        Some("response.audio.delta") => match v.get("delta").and_then(Value::as_str) {
            Some(delta) => InboundKind::AudioDelta(delta.to_string()),
            None => InboundKind::Other,
        },
        Some("session.created") => InboundKind::SessionCreated,
        _ => InboundKind::Other,
    }
}
