//! The session orchestrator: connection lifecycle, configuration pushes, and
//! routing of user utterances to a response strategy.
//!
//! One orchestrator owns at most one live transport session. All event
//! handling for a connection happens on a single router task fed by one
//! ordered channel, so no event for the same connection is ever reordered or
//! handled concurrently. Supervisor calls are the only work spawned off that
//! path; they are tracked so teardown cancels whatever is still in flight.

use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::protocol::{self, ControlEvent, RateLimit};
use crate::supervisor::{self, EscalationPolicy, SupervisorClient};
use crate::tools::{ToolDefinition, ToolProvider};
use crate::transport::{AudioIo, Connector, TransportEvent, TransportSession};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

/// Connection lifecycle. Transitions come exclusively from `connect()`,
/// `disconnect()`, and transport events.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Disconnected,
    Error,
}

/// Last-known rate-limit telemetry, replaced wholesale on every update.
/// Purely observational; never blocks anything.
pub type RateLimitSnapshot = Vec<RateLimit>;

type UnitCallback = Box<dyn Fn() + Send + Sync>;
type TextCallback = Box<dyn Fn(&str) + Send + Sync>;
type RateCallback = Box<dyn Fn(&RateLimitSnapshot) + Send + Sync>;

/// Caller-supplied observers. All fire-and-forget; no return value is
/// consumed.
#[derive(Default)]
pub struct SessionCallbacks {
    on_connected: Option<UnitCallback>,
    on_disconnected: Option<UnitCallback>,
    on_error: Option<TextCallback>,
    on_log: Option<TextCallback>,
    on_rate_limits: Option<RateCallback>,
}

impl SessionCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_connected(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_connected = Some(Box::new(f));
        self
    }

    pub fn on_disconnected(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_disconnected = Some(Box::new(f));
        self
    }

    pub fn on_error(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }

    /// Append-only log sink; every inbound event, outbound control message,
    /// and state transition is mirrored here.
    pub fn on_log(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_log = Some(Box::new(f));
        self
    }

    pub fn on_rate_limits(mut self, f: impl Fn(&RateLimitSnapshot) + Send + Sync + 'static) -> Self {
        self.on_rate_limits = Some(Box::new(f));
        self
    }

    fn connected(&self) {
        if let Some(f) = &self.on_connected {
            f();
        }
    }

    fn disconnected(&self) {
        if let Some(f) = &self.on_disconnected {
            f();
        }
    }

    fn error(&self, message: &str) {
        if let Some(f) = &self.on_error {
            f(message);
        }
    }

    fn log(&self, message: &str) {
        if let Some(f) = &self.on_log {
            f(message);
        }
    }

    fn rate_limits(&self, snapshot: &RateLimitSnapshot) {
        if let Some(f) = &self.on_rate_limits {
            f(snapshot);
        }
    }
}

struct ActiveConnection {
    transport: Arc<TransportSession>,
    router: JoinHandle<()>,
}

/// Top-level owner of one realtime voice session.
pub struct SessionOrchestrator {
    connector: Arc<dyn Connector>,
    supervisor: Arc<dyn SupervisorClient>,
    tools: Arc<dyn ToolProvider>,
    policy: Arc<dyn EscalationPolicy>,
    callbacks: Arc<SessionCallbacks>,
    state: Arc<Mutex<ConnectionState>>,
    config: Arc<Mutex<SessionConfig>>,
    rate_limits: Arc<Mutex<RateLimitSnapshot>>,
    active: Option<ActiveConnection>,
}

impl SessionOrchestrator {
    pub fn new(
        connector: Arc<dyn Connector>,
        supervisor: Arc<dyn SupervisorClient>,
        tools: Arc<dyn ToolProvider>,
        policy: Arc<dyn EscalationPolicy>,
        callbacks: SessionCallbacks,
    ) -> Self {
        Self {
            connector,
            supervisor,
            tools,
            policy,
            callbacks: Arc::new(callbacks),
            state: Arc::new(Mutex::new(ConnectionState::Idle)),
            config: Arc::new(Mutex::new(SessionConfig::default())),
            rate_limits: Arc::new(Mutex::new(Vec::new())),
            active: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().expect("state lock")
    }

    pub fn rate_limits(&self) -> RateLimitSnapshot {
        self.rate_limits.lock().expect("rate limits lock").clone()
    }

    /// Establishes the session. A no-op while already connecting or
    /// connected. On failure the transport is fully torn down, the state
    /// becomes `Error`, and the failure is surfaced to the caller.
    pub async fn connect(
        &mut self,
        config: SessionConfig,
        audio: AudioIo,
    ) -> Result<(), SessionError> {
        match self.state() {
            ConnectionState::Connecting | ConnectionState::Connected => {
                debug!("connect ignored: session already active");
                return Ok(());
            }
            _ => {}
        }
        self.set_state(ConnectionState::Connecting);
        *self.config.lock().expect("config lock") = config.clone();

        let transport = match self.connector.connect(&config, audio).await {
            Ok(transport) => transport,
            Err(e) => {
                // The connector tears down whatever it opened before failing.
                self.set_state(ConnectionState::Error);
                self.callbacks.error(&e.to_string());
                return Err(e);
            }
        };
        let events = match transport.take_events() {
            Some(events) => events,
            None => {
                transport.close();
                self.set_state(ConnectionState::Error);
                let e = SessionError::Handshake("transport yielded no event stream".to_string());
                self.callbacks.error(&e.to_string());
                return Err(e);
            }
        };

        self.set_state(ConnectionState::Connected);
        self.callbacks.connected();

        let tools = self.primary_tools(&config).await;
        send_logged(
            &transport,
            &self.callbacks,
            protocol::encode_session_update(&config, &tools),
        )
        .await;

        let router = Router {
            transport: transport.clone(),
            supervisor: self.supervisor.clone(),
            policy: self.policy.clone(),
            config: self.config.clone(),
            rate_limits: self.rate_limits.clone(),
            callbacks: self.callbacks.clone(),
            state: self.state.clone(),
            handled: HashSet::new(),
            inflight: JoinSet::new(),
        };
        let router = tokio::spawn(router.run(events));
        self.active = Some(ActiveConnection { transport, router });
        Ok(())
    }

    /// Replaces the live configuration and re-sends it over the open control
    /// channel. A no-op, not an error, when not connected.
    pub async fn update_session(&mut self, config: SessionConfig) {
        if self.state() != ConnectionState::Connected {
            debug!("update_session ignored: not connected");
            return;
        }
        *self.config.lock().expect("config lock") = config.clone();
        let tools = self.primary_tools(&config).await;
        if let Some(active) = &self.active {
            send_logged(
                &active.transport,
                &self.callbacks,
                protocol::encode_session_update(&config, &tools),
            )
            .await;
        }
    }

    /// Tears the session down. Safe from any state and idempotent. Any
    /// in-flight supervisor call is cancelled rather than acted on.
    pub async fn disconnect(&mut self) {
        let had_connection = self.active.is_some();
        if let Some(active) = self.active.take() {
            // Aborting the router drops its JoinSet, cancelling pending
            // supervisor calls with it.
            active.router.abort();
            active.transport.close();
        }
        let was_idle = self.state() == ConnectionState::Idle;
        self.set_state(ConnectionState::Idle);
        if had_connection || !was_idle {
            self.callbacks.disconnected();
        }
    }

    async fn primary_tools(&self, config: &SessionConfig) -> Vec<ToolDefinition> {
        if !config.primary_model_gets_tools() {
            return Vec::new();
        }
        match self.tools.list_tools().await {
            Ok(tools) => tools,
            Err(e) => {
                warn!(error = %e, "tool provider failed; continuing without tools");
                self.callbacks
                    .log(&format!("tool provider failed, continuing without tools: {e}"));
                Vec::new()
            }
        }
    }

    fn set_state(&self, next: ConnectionState) {
        let mut state = self.state.lock().expect("state lock");
        let previous = *state;
        if previous == next {
            return;
        }
        info!(from = ?previous, to = ?next, "connection state changed");
        self.callbacks.log(&format!("state: {previous:?} -> {next:?}"));
        *state = next;
    }
}

async fn send_logged(
    transport: &TransportSession,
    callbacks: &SessionCallbacks,
    frame: String,
) {
    callbacks.log(&format!("-> {frame}"));
    transport.send(frame).await;
}

/// Per-connection event router. Created at connect, destroyed at disconnect,
/// taking the handled-item set and any in-flight supervisor work with it.
struct Router {
    transport: Arc<TransportSession>,
    supervisor: Arc<dyn SupervisorClient>,
    policy: Arc<dyn EscalationPolicy>,
    config: Arc<Mutex<SessionConfig>>,
    rate_limits: Arc<Mutex<RateLimitSnapshot>>,
    callbacks: Arc<SessionCallbacks>,
    state: Arc<Mutex<ConnectionState>>,
    handled: HashSet<String>,
    inflight: JoinSet<()>,
}

impl Router {
    async fn run(mut self, mut events: mpsc::Receiver<TransportEvent>) {
        while let Some(event) = events.recv().await {
            // Reap finished supervisor tasks so the set stays small.
            while self.inflight.try_join_next().is_some() {}

            match event {
                TransportEvent::Open => self.callbacks.log("control channel open"),
                TransportEvent::Control(raw) => {
                    self.callbacks.log(&format!("<- {raw}"));
                    match protocol::decode(&raw) {
                        Some(control) => self.handle_control(control).await,
                        None => debug!("dropping unrecognized inbound frame"),
                    }
                }
                TransportEvent::Closed => {
                    let mut state = self.state.lock().expect("state lock");
                    if *state == ConnectionState::Connected {
                        *state = ConnectionState::Disconnected;
                        drop(state);
                        self.callbacks.log("state: Connected -> Disconnected");
                        self.callbacks.disconnected();
                    }
                    break;
                }
            }
        }
        // Dropping `inflight` cancels supervisor calls still pending.
    }

    async fn handle_control(&mut self, event: ControlEvent) {
        match event {
            ControlEvent::RateLimitsUpdated { rate_limits } => {
                *self.rate_limits.lock().expect("rate limits lock") = rate_limits.clone();
                self.callbacks.rate_limits(&rate_limits);
            }
            ControlEvent::SessionUpdated { .. } => {
                debug!("session configuration acknowledged");
            }
            ControlEvent::ItemCreated { item } => {
                if item.role != "user" {
                    return;
                }
                if let Some(text) = item.inline_text().map(|t| t.to_string()) {
                    self.route_utterance(item.id.clone(), text).await;
                }
            }
            ControlEvent::TranscriptionCompleted { item_id, transcript } => {
                self.route_utterance(item_id, transcript).await;
            }
        }
    }

    /// Routes one completed utterance to a response strategy, at most once
    /// per item id for the lifetime of the connection.
    async fn route_utterance(&mut self, item_id: String, text: String) {
        let text = text.trim().to_string();
        if text.is_empty() || item_id.is_empty() {
            return;
        }
        if !self.handled.insert(item_id.clone()) {
            debug!(item_id, "utterance already routed");
            return;
        }

        let (use_supervisor, mode) = {
            let config = self.config.lock().expect("config lock");
            (config.use_supervisor, config.supervisor_mode)
        };
        if !use_supervisor {
            // Turn-detection auto-response handles the reply; nothing to do.
            return;
        }

        if self.policy.should_escalate(&text, mode) {
            debug!(item_id, "escalating utterance to supervisor");
            let transport = self.transport.clone();
            let supervisor = self.supervisor.clone();
            let callbacks = self.callbacks.clone();
            // Independent of the event path: later events for other items
            // keep flowing while this call is pending.
            self.inflight.spawn(async move {
                match supervisor.complete(&text).await {
                    Ok(answer) if !answer.trim().is_empty() => {
                        let frame = protocol::encode_response_create(
                            &supervisor::verbatim_reply_instructions(&answer),
                        );
                        send_logged(&transport, &callbacks, frame).await;
                    }
                    Ok(_) => {
                        warn!(item_id, "supervisor returned an empty answer; turn dropped");
                    }
                    Err(e) => {
                        warn!(item_id, error = %e, "supervisor call failed; turn dropped");
                        callbacks.log(&format!("supervisor call failed, turn dropped: {e}"));
                    }
                }
            });
        } else {
            let frame = protocol::encode_response_create(&supervisor::direct_reply_instructions(
                &text,
            ));
            send_logged(&self.transport, &self.callbacks, frame).await;
        }
    }
}
