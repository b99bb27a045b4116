//! Session orchestrator: one event loop owns every store mutation
use crate::config::{Config, SendRoute};
use crate::error::{ChatError, FetchError, Result, TransportError, ValidationError};
use crate::fetcher::{HistoryFetcher, HistoryService, HttpHistoryService};
use crate::store::ConversationStore;
use crate::transport::{Dialer, TransportAdapter, TransportEvent, TransportSettings, WsDialer};
use crate::types::{Change, ConnectionState, ConversationSummary, Message};
use crate::wire::OutboundFrame;
use chrono::Utc;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{broadcast, mpsc, oneshot, RwLock, RwLockReadGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Requests handled by the event loop
enum Command {
    Select {
        peer: String,
        reply: oneshot::Sender<u64>,
    },
    RecordOptimistic {
        peer: String,
        content: String,
        reply: oneshot::Sender<Uuid>,
    },
    SendConfirmed {
        local_id: Uuid,
        message: Message,
        reply: oneshot::Sender<()>,
    },
    SendFailed {
        local_id: Uuid,
        reply: oneshot::Sender<()>,
    },
    Retry {
        local_id: Uuid,
        reply: oneshot::Sender<Option<Message>>,
    },
}

/// Completions of pull requests spawned by the loop
enum Completion {
    History {
        peer: String,
        generation: u64,
        outcome: std::result::Result<Vec<Message>, FetchError>,
    },
    Summaries(std::result::Result<Vec<ConversationSummary>, FetchError>),
    Online(std::result::Result<Vec<String>, FetchError>),
}

/// Everything the event loop reacts to, in one arrival-ordered queue
enum Input {
    Transport(TransportEvent),
    Command(Command),
    Completion(Completion),
}

/// A logged-in user's synchronized conversation state.
///
/// Created with [`ChatSession::start`] on login, torn down with
/// [`ChatSession::shutdown`] on logout.
pub struct ChatSession {
    config: Config,
    store: Arc<RwLock<ConversationStore>>,
    transport: Arc<TransportAdapter>,
    fetcher: HistoryFetcher,
    changes: broadcast::Sender<Change>,
    inputs: mpsc::UnboundedSender<Input>,
    event_loop: Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl ChatSession {
    /// Session against the real service: WebSocket push channel plus HTTP pulls
    pub fn connect(config: Config) -> Result<Self> {
        let dialer = Arc::new(WsDialer::from_config(&config));
        let service = Arc::new(HttpHistoryService::from_config(&config));
        Self::start(config, dialer, service)
    }

    /// Start the event loop, open the push channel and run the bootstrap pulls
    pub fn start(
        config: Config,
        dialer: Arc<dyn Dialer>,
        service: Arc<dyn HistoryService>,
    ) -> Result<Self> {
        config.validate()?;
        let identity = config.identity.clone();
        let store = Arc::new(RwLock::new(ConversationStore::new(
            identity.clone(),
            config.reconcile_window,
        )));
        let transport = Arc::new(TransportAdapter::new(TransportSettings::from(&config), dialer));
        let fetcher = HistoryFetcher::new(service, config.request_timeout);
        let (changes, _) = broadcast::channel(config.change_buffer);
        let (inputs, inputs_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        let events = inputs.clone();
        transport.subscribe_with(move |event| events.send(Input::Transport(event)).is_ok());
        transport.connect(&identity);

        let event_loop = EventLoop {
            identity: identity.clone(),
            store: store.clone(),
            fetcher: fetcher.clone(),
            changes: changes.clone(),
            inputs: inputs.clone(),
            shutdown: shutdown.clone(),
            history_token: None,
            presence_from_push: false,
            opened_before: false,
        };
        info!(%identity, "session started");
        let task = tokio::spawn(event_loop.run(inputs_rx));

        Ok(Self {
            config,
            store,
            transport,
            fetcher,
            changes,
            inputs,
            event_loop: Mutex::new(Some(task)),
            shutdown,
        })
    }

    pub fn identity(&self) -> &str {
        &self.config.identity
    }

    /// Change notifications from now on
    pub fn subscribe(&self) -> broadcast::Receiver<Change> {
        self.changes.subscribe()
    }

    /// Read-only view of the current state
    pub async fn store(&self) -> RwLockReadGuard<'_, ConversationStore> {
        self.store.read().await
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.transport.state()
    }

    /// Select `peer` and load its history; returns the fetch generation
    pub async fn select_peer(&self, peer: &str) -> Result<u64> {
        let peer = peer.trim();
        if peer.is_empty() {
            return Err(ValidationError::EmptyPeer.into());
        }
        let (reply, rx) = oneshot::channel();
        self.request(
            Command::Select {
                peer: peer.to_string(),
                reply,
            },
            rx,
        )
        .await
    }

    /// Send `content` to `peer`; returns the local handle of the entry.
    ///
    /// The entry is visible before the network call and stays visible, flagged
    /// as failed, when the send does not go through.
    pub async fn send_message(&self, peer: &str, content: &str) -> Result<Uuid> {
        let peer = peer.trim();
        if peer.is_empty() {
            return Err(ValidationError::EmptyPeer.into());
        }
        let content = content.trim();
        if content.is_empty() {
            return Err(ValidationError::EmptyContent.into());
        }

        let (reply, rx) = oneshot::channel();
        let local_id = self
            .request(
                Command::RecordOptimistic {
                    peer: peer.to_string(),
                    content: content.to_string(),
                    reply,
                },
                rx,
            )
            .await?;
        self.dispatch_send(local_id, peer, content).await?;
        Ok(local_id)
    }

    /// Re-send a failed entry in place
    pub async fn retry_send(&self, local_id: Uuid) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        let entry = self
            .request(Command::Retry { local_id, reply }, rx)
            .await?
            .ok_or(ChatError::UnknownMessage(local_id))?;
        info!(%local_id, peer = %entry.receiver, "retrying send");
        self.dispatch_send(local_id, &entry.receiver, &entry.content).await
    }

    async fn dispatch_send(&self, local_id: Uuid, peer: &str, content: &str) -> Result<()> {
        let outcome = if self.transport.state() != ConnectionState::Open {
            Err(ChatError::from(TransportError::NotConnected))
        } else {
            match self.config.send_route {
                SendRoute::Rest => match self
                    .fetcher
                    .post_message(&self.config.identity, peer, content)
                    .await
                {
                    Ok(message) => {
                        let (reply, rx) = oneshot::channel();
                        self.request(
                            Command::SendConfirmed {
                                local_id,
                                message,
                                reply,
                            },
                            rx,
                        )
                        .await
                    }
                    Err(e) => Err(e.into()),
                },
                // The echo of the push channel reconciles the entry
                SendRoute::Push => self
                    .transport
                    .send(OutboundFrame::Send {
                        content: content.to_string(),
                        receiver: peer.to_string(),
                    })
                    .await
                    .map_err(ChatError::from),
            }
        };

        if let Err(e) = &outcome {
            warn!(%local_id, %peer, "send failed: {}", e);
            let (reply, rx) = oneshot::channel();
            self.request(Command::SendFailed { local_id, reply }, rx).await?;
        }
        outcome
    }

    async fn request<T>(&self, command: Command, rx: oneshot::Receiver<T>) -> Result<T> {
        self.notify(command)?;
        rx.await.map_err(|_| ChatError::SessionClosed)
    }

    fn notify(&self, command: Command) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(ChatError::SessionClosed);
        }
        self.inputs
            .send(Input::Command(command))
            .map_err(|_| ChatError::SessionClosed)
    }

    /// Stop the event loop, cancel pending fetches and close the push channel
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let task = self
            .event_loop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("session event loop ended abnormally: {}", e);
            }
        }
        self.transport.close().await;
        info!(identity = %self.config.identity, "session closed");
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

// ─── Event loop ──────────────────────────────────────────────────────────────

struct EventLoop {
    identity: String,
    store: Arc<RwLock<ConversationStore>>,
    fetcher: HistoryFetcher,
    changes: broadcast::Sender<Change>,
    inputs: mpsc::UnboundedSender<Input>,
    shutdown: CancellationToken,
    /// Token of the in-flight history fetch
    history_token: Option<CancellationToken>,
    /// A push snapshot arrived on the current link; pulls no longer apply
    presence_from_push: bool,
    opened_before: bool,
}

impl EventLoop {
    async fn run(mut self, mut inputs: mpsc::UnboundedReceiver<Input>) {
        self.bootstrap();
        loop {
            let input = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                input = inputs.recv() => match input {
                    Some(input) => input,
                    None => break,
                },
            };
            match input {
                Input::Transport(event) => self.on_transport_event(event).await,
                Input::Command(command) => self.on_command(command).await,
                Input::Completion(completion) => self.on_completion(completion).await,
            }
        }
        if let Some(token) = self.history_token.take() {
            token.cancel();
        }
        debug!(identity = %self.identity, "event loop stopped");
    }

    /// Summary list and online users; also run after every reconnect
    fn bootstrap(&self) {
        let fetcher = self.fetcher.clone();
        let identity = self.identity.clone();
        self.spawn_pull(async move { Completion::Summaries(fetcher.fetch_summaries(&identity).await) });
        let fetcher = self.fetcher.clone();
        self.spawn_pull(async move { Completion::Online(fetcher.fetch_online_users().await) });
    }

    fn spawn_pull<F>(&self, pull: F)
    where
        F: std::future::Future<Output = Completion> + Send + 'static,
    {
        let inputs = self.inputs.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                completion = pull => {
                    let _ = inputs.send(Input::Completion(completion));
                }
            }
        });
    }

    fn start_history_fetch(&mut self, peer: String, generation: u64) {
        if let Some(previous) = self.history_token.take() {
            previous.cancel();
        }
        let token = self.shutdown.child_token();
        self.history_token = Some(token.clone());
        debug!(%peer, generation, "history fetch issued");

        let fetcher = self.fetcher.clone();
        let identity = self.identity.clone();
        self.spawn_pull(async move {
            let outcome = fetcher.fetch_history(&identity, &peer, &token).await;
            Completion::History {
                peer,
                generation,
                outcome,
            }
        });
    }

    fn publish(&self, changes: Vec<Change>) {
        for change in changes {
            // No subscribers is fine
            let _ = self.changes.send(change);
        }
    }

    async fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::MessageArrived(message) => {
                let changes = self.store.write().await.apply_incoming_message(message);
                self.publish(changes);
            }
            TransportEvent::PresenceSnapshot(users) => {
                self.presence_from_push = true;
                let changes = self.store.write().await.apply_presence_snapshot(users);
                self.publish(changes);
            }
            TransportEvent::ConnectionStateChanged(state) => {
                self.publish(vec![Change::Connection(state)]);
                match state {
                    ConnectionState::Open if self.opened_before => self.resync().await,
                    ConnectionState::Open => self.opened_before = true,
                    ConnectionState::Closed | ConnectionState::Reconnecting => {
                        self.presence_from_push = false;
                    }
                    ConnectionState::Connecting => {}
                }
            }
        }
    }

    /// Recover whatever was missed while the push channel was down
    async fn resync(&mut self) {
        info!(identity = %self.identity, "push channel reopened, resyncing");
        self.bootstrap();
        let selection = self.store.read().await.selection().clone();
        if let Some(peer) = selection.selected_peer {
            self.start_history_fetch(peer, selection.fetch_generation);
        }
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Select { peer, reply } => {
                let (generation, changes) = self.store.write().await.select_peer(&peer);
                self.publish(changes);
                self.start_history_fetch(peer, generation);
                let _ = reply.send(generation);
            }
            Command::RecordOptimistic {
                peer,
                content,
                reply,
            } => {
                let (local_id, changes) =
                    self.store
                        .write()
                        .await
                        .record_optimistic_send(&peer, &content, Utc::now());
                self.publish(changes);
                let _ = reply.send(local_id);
            }
            Command::SendConfirmed {
                local_id,
                message,
                reply,
            } => {
                let changes = self.store.write().await.apply_send_confirmed(local_id, message);
                self.publish(changes);
                let _ = reply.send(());
            }
            Command::SendFailed { local_id, reply } => {
                let changes = self.store.write().await.mark_send_failed(local_id);
                self.publish(changes);
                let _ = reply.send(());
            }
            Command::Retry { local_id, reply } => {
                let retried = self.store.write().await.mark_send_retrying(local_id);
                let entry = retried.map(|(entry, changes)| {
                    self.publish(changes);
                    entry
                });
                let _ = reply.send(entry);
            }
        }
    }

    async fn on_completion(&mut self, completion: Completion) {
        match completion {
            Completion::History {
                peer,
                generation,
                outcome,
            } => match outcome {
                Ok(messages) => {
                    let changes = self
                        .store
                        .write()
                        .await
                        .apply_history_loaded(&peer, messages, generation);
                    self.publish(changes);
                }
                Err(FetchError::Cancelled) => {
                    debug!(%peer, generation, "cancelled history fetch discarded");
                }
                Err(error) => {
                    let current = self.store.read().await.selection().fetch_generation;
                    if generation != current {
                        debug!(%peer, generation, current, "stale history failure ignored");
                        return;
                    }
                    warn!(%peer, generation, "history fetch failed: {}", error);
                    self.publish(vec![Change::FetchFailed { peer, error }]);
                }
            },
            Completion::Summaries(Ok(summaries)) => {
                let changes = self.store.write().await.apply_summaries(summaries);
                self.publish(changes);
            }
            Completion::Summaries(Err(error)) => {
                warn!(identity = %self.identity, "summary fetch failed: {}", error);
            }
            Completion::Online(Ok(users)) => {
                if self.presence_from_push {
                    debug!("online users pull superseded by push snapshot");
                    return;
                }
                let changes = self.store.write().await.apply_presence_snapshot(users);
                self.publish(changes);
            }
            Completion::Online(Err(error)) => {
                warn!(identity = %self.identity, "online users fetch failed: {}", error);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Origin;
    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone};
    use std::time::Duration;

    /// Service that never answers; completions are queued by hand
    struct Silent;

    #[async_trait]
    impl HistoryService for Silent {
        async fn fetch_summaries(
            &self,
            _: &str,
        ) -> std::result::Result<Vec<ConversationSummary>, FetchError> {
            std::future::pending().await
        }

        async fn fetch_history(&self, _: &str, _: &str) -> std::result::Result<Vec<Message>, FetchError> {
            std::future::pending().await
        }

        async fn fetch_online_users(&self) -> std::result::Result<Vec<String>, FetchError> {
            std::future::pending().await
        }

        async fn post_message(&self, _: &str, _: &str, _: &str) -> std::result::Result<Message, FetchError> {
            std::future::pending().await
        }
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn event_loop(
        inputs: mpsc::UnboundedSender<Input>,
        changes: broadcast::Sender<Change>,
        shutdown: CancellationToken,
    ) -> (EventLoop, Arc<RwLock<ConversationStore>>) {
        let store = Arc::new(RwLock::new(ConversationStore::new("alice", Duration::from_secs(30))));
        let event_loop = EventLoop {
            identity: "alice".to_string(),
            store: store.clone(),
            fetcher: HistoryFetcher::new(Arc::new(Silent), Duration::from_secs(3600)),
            changes,
            inputs,
            shutdown,
            history_token: None,
            presence_from_push: false,
            opened_before: false,
        };
        (event_loop, store)
    }

    #[tokio::test]
    async fn test_inputs_are_applied_in_arrival_order() {
        let (inputs, inputs_rx) = mpsc::unbounded_channel();
        let (changes, mut published) = broadcast::channel(16);
        let shutdown = CancellationToken::new();
        let (event_loop, store) = event_loop(inputs.clone(), changes, shutdown.clone());

        let carol = ConversationSummary {
            peer: "carol".to_string(),
            last_message_preview: "yo".to_string(),
            last_timestamp: at(50),
            unread: false,
        };
        let hello = Message {
            id: Some(1),
            local_id: None,
            sender: "bob".to_string(),
            receiver: "alice".to_string(),
            content: "hello".to_string(),
            timestamp: at(10),
            origin: Origin::Remote,
            failed: false,
        };
        let queued = [
            Input::Completion(Completion::Summaries(Ok(vec![carol]))),
            Input::Transport(TransportEvent::MessageArrived(hello)),
            Input::Transport(TransportEvent::PresenceSnapshot(vec!["dave".to_string()])),
            Input::Completion(Completion::Online(Ok(vec!["erin".to_string()]))),
        ];
        for input in queued {
            assert!(inputs.send(input).is_ok());
        }
        let (reply, drained) = oneshot::channel();
        assert!(inputs
            .send(Input::Command(Command::Retry {
                local_id: Uuid::new_v4(),
                reply,
            }))
            .is_ok());

        let task = tokio::spawn(event_loop.run(inputs_rx));
        assert_eq!(drained.await.unwrap(), None);

        let mut seen = Vec::new();
        while let Ok(change) = published.try_recv() {
            seen.push(change);
        }
        assert_eq!(
            seen,
            vec![
                Change::Summaries,
                Change::Messages { peer: "bob".to_string() },
                Change::Summaries,
                Change::Presence,
            ]
        );

        {
            let store = store.read().await;
            assert!(store.is_online("dave"));
            assert!(!store.is_online("erin"));
            let peers: Vec<_> = store.summaries().map(|s| s.peer.clone()).collect();
            assert_eq!(peers, vec!["carol", "bob"]);
        }

        shutdown.cancel();
        task.await.unwrap();
    }
}
