use super::{Dialer, PushLink};
use crate::config::Config;
use crate::error::TransportError;
use crate::types::{ConnectionState, Message};
use crate::wire::{InboundFrame, OutboundFrame};
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Typed events delivered to transport subscribers
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    MessageArrived(Message),
    PresenceSnapshot(Vec<String>),
    ConnectionStateChanged(ConnectionState),
}

/// Timers and limits of the push channel
#[derive(Debug, Clone)]
pub struct TransportSettings {
    pub keepalive_interval: Duration,
    pub max_missed_keepalives: Option<u32>,
    pub reconnect_base: Duration,
    pub reconnect_max: Duration,
    pub connect_timeout: Duration,
}

impl From<&Config> for TransportSettings {
    fn from(config: &Config) -> Self {
        Self {
            keepalive_interval: config.keepalive_interval,
            max_missed_keepalives: config.max_missed_keepalives,
            reconnect_base: config.reconnect_base,
            reconnect_max: config.reconnect_max,
            connect_timeout: config.connect_timeout,
        }
    }
}

/// `base * 2^attempt`, capped at `max`
pub fn backoff_delay(base: Duration, max: Duration, attempt: u32) -> Duration {
    let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
    base.saturating_mul(factor).min(max)
}

/// Event sink; returns false once its receiving side is gone
type Sink = Box<dyn Fn(TransportEvent) -> bool + Send>;
type Subscribers = Arc<Mutex<Vec<Sink>>>;

fn emit(subscribers: &Subscribers, event: TransportEvent) {
    let mut subs = subscribers.lock().unwrap_or_else(PoisonError::into_inner);
    subs.retain(|sink| sink(event.clone()));
}

struct SendRequest {
    frame: OutboundFrame,
    reply: oneshot::Sender<Result<(), TransportError>>,
}

impl SendRequest {
    fn reject(self) {
        let _ = self.reply.send(Err(TransportError::NotConnected));
    }
}

/// Command side of the running link, shared with the session
#[derive(Clone)]
pub struct TransportHandle {
    identity: String,
    commands: mpsc::UnboundedSender<SendRequest>,
    state: watch::Receiver<ConnectionState>,
    shutdown: CancellationToken,
}

impl TransportHandle {
    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Write one frame; fails with `NotConnected` unless the link is `Open`
    pub async fn send(&self, frame: OutboundFrame) -> Result<(), TransportError> {
        if self.is_shut_down() || self.state() != ConnectionState::Open {
            return Err(TransportError::NotConnected);
        }
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(SendRequest { frame, reply })
            .map_err(|_| TransportError::NotConnected)?;
        rx.await.unwrap_or_else(|_| {
            Err(TransportError::ConnectionLost("link task stopped".to_string()))
        })
    }
}

/// Owns the session's push link: dialing, keepalive, reconnect, event fan-out
pub struct TransportAdapter {
    settings: TransportSettings,
    dialer: Arc<dyn Dialer>,
    subscribers: Subscribers,
    current: Mutex<Option<(TransportHandle, JoinHandle<()>)>>,
}

impl TransportAdapter {
    pub fn new(settings: TransportSettings, dialer: Arc<dyn Dialer>) -> Self {
        Self {
            settings,
            dialer,
            subscribers: Arc::new(Mutex::new(Vec::new())),
            current: Mutex::new(None),
        }
    }

    /// Receive every event emitted from now on
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<TransportEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribe_with(move |event| tx.send(event).is_ok());
        rx
    }

    /// Deliver events to `sink` in emission order until it returns false
    pub fn subscribe_with<F>(&self, sink: F)
    where
        F: Fn(TransportEvent) -> bool + Send + 'static,
    {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Box::new(sink));
    }

    /// Start the link for `identity`; a no-op returning the live handle if already running
    pub fn connect(&self, identity: &str) -> TransportHandle {
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some((handle, _)) = current.as_ref() {
            if !handle.is_shut_down() {
                debug!(identity = %handle.identity, "connect on a live transport ignored");
                return handle.clone();
            }
        }

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let shutdown = CancellationToken::new();
        let handle = TransportHandle {
            identity: identity.to_string(),
            commands: commands_tx,
            state: state_rx,
            shutdown: shutdown.clone(),
        };

        let supervisor = Supervisor {
            identity: identity.to_string(),
            settings: self.settings.clone(),
            dialer: self.dialer.clone(),
            subscribers: self.subscribers.clone(),
            commands: commands_rx,
            state: state_tx,
            shutdown,
        };
        info!(%identity, "starting push channel");
        let task = tokio::spawn(supervisor.run());
        *current = Some((handle.clone(), task));
        handle
    }

    pub fn handle(&self) -> Option<TransportHandle> {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|(handle, _)| handle.clone())
    }

    pub fn state(&self) -> ConnectionState {
        self.handle()
            .map(|h| h.state())
            .unwrap_or(ConnectionState::Closed)
    }

    pub async fn send(&self, frame: OutboundFrame) -> Result<(), TransportError> {
        match self.handle() {
            Some(handle) => handle.send(frame).await,
            None => Err(TransportError::NotConnected),
        }
    }

    /// Close the link for good and wait for the supervisor to stop
    pub async fn close(&self) {
        let taken = self
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some((handle, task)) = taken {
            handle.shutdown.cancel();
            if let Err(e) = task.await {
                warn!("push channel task ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for TransportAdapter {
    fn drop(&mut self) {
        let current = self.current.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some((handle, _)) = current.take() {
            handle.shutdown.cancel();
        }
    }
}

// ─── Supervisor task ─────────────────────────────────────────────────────────

enum LinkEnd {
    Shutdown,
    Dropped(String),
}

struct Supervisor {
    identity: String,
    settings: TransportSettings,
    dialer: Arc<dyn Dialer>,
    subscribers: Subscribers,
    commands: mpsc::UnboundedReceiver<SendRequest>,
    state: watch::Sender<ConnectionState>,
    shutdown: CancellationToken,
}

impl Supervisor {
    async fn run(mut self) {
        self.set_state(ConnectionState::Connecting);
        let mut attempt: u32 = 0;
        let mut first = true;

        loop {
            if !first {
                self.set_state(ConnectionState::Reconnecting);
                let delay = backoff_delay(
                    self.settings.reconnect_base,
                    self.settings.reconnect_max,
                    attempt,
                )
                .mul_f64(1.0 + rand::random::<f64>() * 0.1)
                .min(self.settings.reconnect_max);
                attempt = attempt.saturating_add(1);
                info!(identity = %self.identity, attempt, ?delay, "scheduling push channel reconnect");
                if self.while_offline(sleep(delay)).await.is_none() {
                    break;
                }
            }
            first = false;

            let dialer = self.dialer.clone();
            let identity = self.identity.clone();
            let connect_timeout = self.settings.connect_timeout;
            let dial = async move { timeout(connect_timeout, dialer.dial(&identity)).await };
            let link = match self.while_offline(dial).await {
                None => break,
                Some(Ok(Ok(link))) => link,
                Some(Ok(Err(e))) => {
                    warn!(identity = %self.identity, "push channel connect failed: {}", e);
                    continue;
                }
                Some(Err(_)) => {
                    warn!(identity = %self.identity, "push channel connect timed out");
                    continue;
                }
            };

            attempt = 0;
            info!(identity = %self.identity, "push channel open");
            self.set_state(ConnectionState::Open);

            match self.run_link(link).await {
                LinkEnd::Shutdown => break,
                LinkEnd::Dropped(reason) => {
                    warn!(identity = %self.identity, %reason, "push channel dropped");
                    self.set_state(ConnectionState::Closed);
                }
            }
        }

        self.commands.close();
        while let Ok(cmd) = self.commands.try_recv() {
            cmd.reject();
        }
        self.set_state(ConnectionState::Closed);
        info!(identity = %self.identity, "push channel stopped");
    }

    /// Drive `fut` while rejecting sends; `None` if shut down first
    async fn while_offline<F: Future>(&mut self, fut: F) -> Option<F::Output> {
        tokio::pin!(fut);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return None,
                out = &mut fut => return Some(out),
                Some(cmd) = self.commands.recv() => cmd.reject(),
            }
        }
    }

    async fn run_link(&mut self, mut link: Box<dyn PushLink>) -> LinkEnd {
        let period = self.settings.keepalive_interval;
        let mut keepalive = interval_at(Instant::now() + period, period);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut silent_intervals: u32 = 0;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    link.close().await;
                    return LinkEnd::Shutdown;
                }
                inbound = link.recv_text() => match inbound {
                    Some(Ok(text)) => {
                        silent_intervals = 0;
                        self.dispatch(&text);
                    }
                    Some(Err(e)) => return LinkEnd::Dropped(e.to_string()),
                    None => return LinkEnd::Dropped("closed by server".to_string()),
                },
                _ = keepalive.tick() => {
                    silent_intervals = silent_intervals.saturating_add(1);
                    if let Some(max) = self.settings.max_missed_keepalives {
                        if silent_intervals >= max {
                            link.close().await;
                            return LinkEnd::Dropped(format!(
                                "no inbound traffic for {} keepalive intervals",
                                silent_intervals
                            ));
                        }
                    }
                    if let Err(e) = write_frame(link.as_mut(), &OutboundFrame::Ping).await {
                        return LinkEnd::Dropped(format!("keepalive failed: {}", e));
                    }
                    debug!(identity = %self.identity, "keepalive sent");
                }
                Some(cmd) = self.commands.recv() => {
                    let result = write_frame(link.as_mut(), &cmd.frame).await;
                    let lost = result.is_err();
                    let _ = cmd.reply.send(result);
                    if lost {
                        return LinkEnd::Dropped(format!("{} write failed", cmd.frame.kind()));
                    }
                }
            }
        }
    }

    fn dispatch(&self, text: &str) {
        match InboundFrame::from_text(text) {
            Ok(InboundFrame::UsersList { users }) => {
                debug!(count = users.len(), "presence snapshot received");
                emit(&self.subscribers, TransportEvent::PresenceSnapshot(users));
            }
            Ok(InboundFrame::NewMessage(wire)) => {
                let msg = wire.into_message(&self.identity);
                emit(&self.subscribers, TransportEvent::MessageArrived(msg));
            }
            Err(_) => debug!(frame = %text, "ignoring unrecognised push frame"),
        }
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next || next == ConnectionState::Connecting {
            emit(&self.subscribers, TransportEvent::ConnectionStateChanged(next));
        }
    }
}

async fn write_frame(link: &mut dyn PushLink, frame: &OutboundFrame) -> Result<(), TransportError> {
    let text = frame
        .to_text()
        .map_err(|e| TransportError::ConnectionLost(format!("encode {}: {}", frame.kind(), e)))?;
    link.send_text(text).await
}
