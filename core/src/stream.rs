//! Auto-reconnecting subscriber for the telemetry push channel.
//!
//! [`StreamingClient`] owns at most one live connection. A connection that
//! errors or ends is closed, the client drops to `Disconnected` and a single
//! reconnect is scheduled on the injected [`Clock`] after a fixed delay.
//! Reconnects repeat indefinitely until [`StreamingClient::stop`].

use crate::auth::AuthSession;
use crate::config::{ClientSettings, DEFAULT_RECONNECT_DELAY};
use crate::error::{ApiError, StreamError};
use crate::gateway::endpoint;
use crate::history::{HistoryBuffer, DEFAULT_HISTORY_CAPACITY};
use crate::sse::SseParser;
use crate::stats::StreamSample;
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use reqwest::header::ACCEPT;
use serde::Serialize;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};
use url::Url;

pub const STATS_STREAM_PATH: &str = "/system/stats/stream";

/// Raw `message` payloads of one open connection. The stream ending or
/// yielding an error both count as a connection failure.
pub type MessageStream = BoxStream<'static, Result<String, StreamError>>;

#[async_trait]
pub trait StreamConnector: Send + Sync {
    /// Resolves once the channel is open.
    async fn connect(&self) -> Result<MessageStream, StreamError>;
}

/// Source of reconnect delays.
pub trait Clock: Send + Sync {
    /// The delay starts when this is called, not when the future is first
    /// polled.
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()>;
}

pub struct TokioClock;

impl Clock for TokioClock {
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Clock that only moves when told to. Lets tests step through reconnect
/// delays without waiting on wall-clock time.
#[derive(Clone, Default)]
pub struct ManualClock {
    inner: Arc<Mutex<ManualClockState>>,
}

#[derive(Default)]
struct ManualClockState {
    now: Duration,
    timers: Vec<(Duration, oneshot::Sender<()>)>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now(&self) -> Duration {
        self.inner.lock().now
    }

    /// Timers still waiting to fire whose sleeper has not been dropped.
    pub fn pending(&self) -> usize {
        self.inner
            .lock()
            .timers
            .iter()
            .filter(|(_, tx)| !tx.is_closed())
            .count()
    }

    pub fn advance(&self, by: Duration) {
        let due = {
            let mut state = self.inner.lock();
            state.now += by;
            let now = state.now;
            let (due, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut state.timers)
                .into_iter()
                .partition(|(deadline, _)| *deadline <= now);
            state.timers = waiting;
            due
        };
        for (_, tx) in due {
            let _ = tx.send(());
        }
    }
}

impl Clock for ManualClock {
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.inner.lock();
            if duration.is_zero() {
                let _ = tx.send(());
            } else {
                let deadline = state.now + duration;
                state.timers.push((deadline, tx));
            }
        }
        Box::pin(async move {
            if rx.await.is_err() {
                futures::future::pending::<()>().await;
            }
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Reported as a transition when the reconnect timer fires, right before
    /// the new attempt enters `Connecting`.
    Reconnecting,
}

#[derive(Debug, Clone)]
pub struct StreamOptions {
    pub reconnect_delay: Duration,
    pub history_capacity: usize,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
        }
    }
}

impl From<&ClientSettings> for StreamOptions {
    fn from(settings: &ClientSettings) -> Self {
        Self {
            reconnect_delay: settings.reconnect_delay,
            history_capacity: settings.history_capacity,
        }
    }
}

struct Machine {
    state: StreamConnectionState,
    // Bumped on every connect attempt, reconnect schedule and stop; callbacks
    // carrying an older value are stale and ignored.
    generation: u64,
    connection: Option<AbortHandle>,
    reconnect: Option<AbortHandle>,
}

struct Shared {
    machine: Mutex<Machine>,
    history: Mutex<HistoryBuffer<StreamSample>>,
    state_tx: watch::Sender<StreamConnectionState>,
    latest_tx: watch::Sender<Option<StreamSample>>,
    transitions: broadcast::Sender<StreamConnectionState>,
    connector: Arc<dyn StreamConnector>,
    clock: Arc<dyn Clock>,
    reconnect_delay: Duration,
}

/// Handle to the telemetry subscription. Clones share the same connection.
///
/// `start`, `stop` and the reconnect machinery spawn onto the current Tokio
/// runtime.
#[derive(Clone)]
pub struct StreamingClient {
    shared: Arc<Shared>,
}

impl StreamingClient {
    pub fn new(
        connector: Arc<dyn StreamConnector>,
        clock: Arc<dyn Clock>,
        options: StreamOptions,
    ) -> Self {
        let (state_tx, _) = watch::channel(StreamConnectionState::Disconnected);
        let (latest_tx, _) = watch::channel(None);
        let (transitions, _) = broadcast::channel(64);
        Self {
            shared: Arc::new(Shared {
                machine: Mutex::new(Machine {
                    state: StreamConnectionState::Disconnected,
                    generation: 0,
                    connection: None,
                    reconnect: None,
                }),
                history: Mutex::new(HistoryBuffer::new(options.history_capacity)),
                state_tx,
                latest_tx,
                transitions,
                connector,
                clock,
                reconnect_delay: options.reconnect_delay,
            }),
        }
    }

    /// Open the channel. A no-op while connecting or connected; a pending
    /// reconnect is replaced by an immediate attempt.
    pub fn start(&self) {
        let shared = &self.shared;
        let mut machine = shared.machine.lock();
        if matches!(
            machine.state,
            StreamConnectionState::Connecting | StreamConnectionState::Connected
        ) {
            return;
        }
        if let Some(timer) = machine.reconnect.take() {
            timer.abort();
        }
        info!("starting telemetry stream");
        shared.begin_connect(&mut machine);
    }

    /// Cancel any pending reconnect and close the live connection. Safe to
    /// call in any state; once it returns no reconnect will start.
    pub fn stop(&self) {
        let shared = &self.shared;
        let mut machine = shared.machine.lock();
        machine.generation += 1;
        let had_timer = machine.reconnect.take().map(|timer| timer.abort()).is_some();
        let had_connection = machine
            .connection
            .take()
            .map(|connection| connection.abort())
            .is_some();
        if machine.state != StreamConnectionState::Disconnected {
            shared.transition(&mut machine, StreamConnectionState::Disconnected);
        }
        if had_timer || had_connection {
            info!(had_timer, had_connection, "telemetry stream stopped");
        }
    }

    pub fn state(&self) -> StreamConnectionState {
        self.shared.machine.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == StreamConnectionState::Connected
    }

    pub fn reconnect_scheduled(&self) -> bool {
        self.shared.machine.lock().reconnect.is_some()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<StreamConnectionState> {
        self.shared.state_tx.subscribe()
    }

    /// Every state change in order, including the transient `Reconnecting`.
    pub fn subscribe_transitions(&self) -> broadcast::Receiver<StreamConnectionState> {
        self.shared.transitions.subscribe()
    }

    pub fn latest(&self) -> Option<StreamSample> {
        self.shared.latest_tx.borrow().clone()
    }

    pub fn subscribe_latest(&self) -> watch::Receiver<Option<StreamSample>> {
        self.shared.latest_tx.subscribe()
    }

    /// Retained samples, oldest first.
    pub fn history(&self) -> Vec<StreamSample> {
        self.shared.history.lock().to_vec()
    }

    pub fn history_capacity(&self) -> usize {
        self.shared.history.lock().capacity()
    }
}

impl Shared {
    fn transition(&self, machine: &mut Machine, next: StreamConnectionState) {
        debug!(from = ?machine.state, to = ?next, "stream state change");
        machine.state = next;
        self.state_tx.send_replace(next);
        let _ = self.transitions.send(next);
    }

    fn begin_connect(self: &Arc<Self>, machine: &mut Machine) {
        machine.generation += 1;
        let generation = machine.generation;
        self.transition(machine, StreamConnectionState::Connecting);
        let task = tokio::spawn(drive_connection(
            Arc::downgrade(self),
            self.connector.clone(),
            generation,
        ));
        machine.connection = Some(task.abort_handle());
    }

    fn opened(&self, generation: u64) -> bool {
        let mut machine = self.machine.lock();
        if machine.generation != generation {
            return false;
        }
        info!("telemetry stream connected");
        self.transition(&mut machine, StreamConnectionState::Connected);
        true
    }

    fn deliver(&self, generation: u64, payload: &str) -> bool {
        let machine = self.machine.lock();
        if machine.generation != generation {
            return false;
        }
        match StreamSample::parse(payload) {
            Ok(sample) => {
                self.history.lock().push(sample.clone());
                self.latest_tx.send_replace(Some(sample));
            }
            Err(err) => warn!(%err, "dropping malformed telemetry sample"),
        }
        drop(machine);
        true
    }

    fn fail(self: &Arc<Self>, generation: u64, err: StreamError) {
        let mut machine = self.machine.lock();
        if machine.generation != generation {
            return;
        }
        warn!(%err, delay_ms = self.reconnect_delay.as_millis() as u64, "telemetry stream failed, scheduling reconnect");
        machine.connection = None;
        self.transition(&mut machine, StreamConnectionState::Disconnected);

        machine.generation += 1;
        let timer_generation = machine.generation;
        let delay = self.clock.sleep(self.reconnect_delay);
        let weak = Arc::downgrade(self);
        let timer = tokio::spawn(async move {
            delay.await;
            if let Some(shared) = weak.upgrade() {
                shared.reconnect(timer_generation);
            }
        });
        machine.reconnect = Some(timer.abort_handle());
    }

    fn reconnect(self: &Arc<Self>, timer_generation: u64) {
        let mut machine = self.machine.lock();
        if machine.generation != timer_generation || machine.reconnect.is_none() {
            return;
        }
        machine.reconnect = None;
        info!("reconnecting telemetry stream");
        self.transition(&mut machine, StreamConnectionState::Reconnecting);
        self.begin_connect(&mut machine);
    }
}

async fn drive_connection(
    shared: Weak<Shared>,
    connector: Arc<dyn StreamConnector>,
    generation: u64,
) {
    let connected = connector.connect().await;
    let Some(strong) = shared.upgrade() else {
        return;
    };
    let mut messages = match connected {
        Ok(messages) => messages,
        Err(err) => {
            strong.fail(generation, err);
            return;
        }
    };
    if !strong.opened(generation) {
        return;
    }
    drop(strong);

    loop {
        let next = messages.next().await;
        let Some(strong) = shared.upgrade() else {
            return;
        };
        match next {
            Some(Ok(payload)) => {
                if !strong.deliver(generation, &payload) {
                    return;
                }
            }
            Some(Err(err)) => {
                strong.fail(generation, err);
                return;
            }
            None => {
                strong.fail(generation, StreamError::Closed);
                return;
            }
        }
    }
}

/// Connects to `GET /system/stats/stream` as a Server-Sent Events channel,
/// carrying the session's bearer token when one is held.
pub struct HttpStreamConnector {
    http: reqwest::Client,
    url: Url,
    session: AuthSession,
}

impl HttpStreamConnector {
    pub fn new(http: reqwest::Client, base_url: &Url, session: AuthSession) -> Result<Self, ApiError> {
        Ok(Self {
            http,
            url: endpoint(base_url, STATS_STREAM_PATH)?,
            session,
        })
    }
}

#[async_trait]
impl StreamConnector for HttpStreamConnector {
    async fn connect(&self) -> Result<MessageStream, StreamError> {
        let mut request = self
            .http
            .get(self.url.clone())
            .header(ACCEPT, "text/event-stream");
        if let Some(token) = self.session.token() {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .map_err(|err| StreamError::Connect(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(StreamError::Status(status.as_u16()));
        }
        Ok(message_stream(response))
    }
}

fn message_stream(response: reqwest::Response) -> MessageStream {
    let mut parser = SseParser::new();
    response
        .bytes_stream()
        .map(move |chunk| match chunk {
            Ok(bytes) => parser
                .feed(&bytes)
                .into_iter()
                .filter(|event| event.is_message())
                .map(|event| Ok(event.data))
                .collect::<Vec<_>>(),
            Err(err) => vec![Err(StreamError::Transport(err.to_string()))],
        })
        .flat_map(stream::iter)
        .boxed()
}
