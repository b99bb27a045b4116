//! In-memory push channel and scripted history service
#![allow(dead_code)]

use async_trait::async_trait;
use chatline_core::fetcher::HistoryService;
use chatline_core::transport::{Dialer, PushLink};
use chatline_core::{ChatSession, ConnectionState, ConversationStore, ConversationSummary, FetchError, Message, Origin, TransportError};
use chrono::{DateTime, TimeZone, Utc};
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

// ─── Push channel ────────────────────────────────────────────────────────────

/// Server end of one accepted link
pub struct ServerConn {
    to_client: mpsc::UnboundedSender<String>,
    from_client: mpsc::UnboundedReceiver<String>,
}

impl ServerConn {
    pub fn push(&self, frame: serde_json::Value) {
        let _ = self.to_client.send(frame.to_string());
    }

    pub fn push_text(&self, text: &str) {
        let _ = self.to_client.send(text.to_string());
    }

    /// Next frame the client wrote, `None` once the client closed the link
    pub async fn next_frame(&mut self) -> Option<serde_json::Value> {
        let text = self.from_client.recv().await?;
        Some(serde_json::from_str(&text).expect("client frames are json"))
    }
}

struct MemoryLink {
    inbound: mpsc::UnboundedReceiver<String>,
    outbound: Option<mpsc::UnboundedSender<String>>,
}

#[async_trait]
impl PushLink for MemoryLink {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        match &self.outbound {
            Some(tx) => tx
                .send(text)
                .map_err(|_| TransportError::ConnectionLost("server gone".to_string())),
            None => Err(TransportError::ConnectionLost("link closed".to_string())),
        }
    }

    async fn recv_text(&mut self) -> Option<Result<String, TransportError>> {
        self.inbound.recv().await.map(Ok)
    }

    async fn close(&mut self) {
        self.outbound = None;
        self.inbound.close();
    }
}

/// Hands every accepted link to the test; can be told to refuse dials
pub struct MemoryDialer {
    accept: AtomicBool,
    dials: AtomicUsize,
    conns: mpsc::UnboundedSender<ServerConn>,
}

impl MemoryDialer {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ServerConn>) {
        let (conns, rx) = mpsc::unbounded_channel();
        let dialer = Arc::new(Self {
            accept: AtomicBool::new(true),
            dials: AtomicUsize::new(0),
            conns,
        });
        (dialer, rx)
    }

    pub fn refusing() -> (Arc<Self>, mpsc::UnboundedReceiver<ServerConn>) {
        let (dialer, rx) = Self::new();
        dialer.set_accept(false);
        (dialer, rx)
    }

    pub fn set_accept(&self, accept: bool) {
        self.accept.store(accept, Ordering::SeqCst);
    }

    pub fn dial_count(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Dialer for MemoryDialer {
    async fn dial(&self, _identity: &str) -> Result<Box<dyn PushLink>, TransportError> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        if !self.accept.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionLost("connection refused".to_string()));
        }
        let (to_client, inbound) = mpsc::unbounded_channel();
        let (outbound, from_client) = mpsc::unbounded_channel();
        let _ = self.conns.send(ServerConn {
            to_client,
            from_client,
        });
        Ok(Box::new(MemoryLink {
            inbound,
            outbound: Some(outbound),
        }))
    }
}

// ─── History service ─────────────────────────────────────────────────────────

/// A history request held open until the test answers it
pub struct HistoryRequest {
    pub peer: String,
    respond: oneshot::Sender<Result<Vec<Message>, FetchError>>,
}

impl HistoryRequest {
    pub fn answer(self, messages: Vec<Message>) {
        let _ = self.respond.send(Ok(messages));
    }

    pub fn fail(self, error: FetchError) {
        let _ = self.respond.send(Err(error));
    }
}

pub struct ScriptedService {
    summaries: Mutex<Vec<ConversationSummary>>,
    online: Mutex<Vec<String>>,
    history: mpsc::UnboundedSender<HistoryRequest>,
    summary_calls: AtomicUsize,
    posts: Mutex<Vec<(String, String, String)>>,
    fail_posts: AtomicBool,
    next_id: AtomicI64,
}

impl ScriptedService {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<HistoryRequest>) {
        let (history, rx) = mpsc::unbounded_channel();
        let service = Arc::new(Self {
            summaries: Mutex::new(Vec::new()),
            online: Mutex::new(Vec::new()),
            history,
            summary_calls: AtomicUsize::new(0),
            posts: Mutex::new(Vec::new()),
            fail_posts: AtomicBool::new(false),
            next_id: AtomicI64::new(100),
        });
        (service, rx)
    }

    pub fn set_summaries(&self, summaries: Vec<ConversationSummary>) {
        *self.summaries.lock().unwrap() = summaries;
    }

    pub fn set_online(&self, users: &[&str]) {
        *self.online.lock().unwrap() = users.iter().map(|u| u.to_string()).collect();
    }

    pub fn set_fail_posts(&self, fail: bool) {
        self.fail_posts.store(fail, Ordering::SeqCst);
    }

    pub fn summary_calls(&self) -> usize {
        self.summary_calls.load(Ordering::SeqCst)
    }

    pub fn posts(&self) -> Vec<(String, String, String)> {
        self.posts.lock().unwrap().clone()
    }
}

#[async_trait]
impl HistoryService for ScriptedService {
    async fn fetch_summaries(&self, _identity: &str) -> Result<Vec<ConversationSummary>, FetchError> {
        self.summary_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.summaries.lock().unwrap().clone())
    }

    async fn fetch_history(&self, _identity: &str, peer: &str) -> Result<Vec<Message>, FetchError> {
        let (respond, rx) = oneshot::channel();
        let request = HistoryRequest {
            peer: peer.to_string(),
            respond,
        };
        if self.history.send(request).is_err() {
            return Err(FetchError::Transient("service stopped".to_string()));
        }
        rx.await
            .unwrap_or_else(|_| Err(FetchError::Transient("request dropped".to_string())))
    }

    async fn fetch_online_users(&self) -> Result<Vec<String>, FetchError> {
        Ok(self.online.lock().unwrap().clone())
    }

    async fn post_message(
        &self,
        identity: &str,
        peer: &str,
        content: &str,
    ) -> Result<Message, FetchError> {
        if self.fail_posts.load(Ordering::SeqCst) {
            return Err(FetchError::Transient("503 Service Unavailable".to_string()));
        }
        self.posts
            .lock()
            .unwrap()
            .push((identity.to_string(), peer.to_string(), content.to_string()));
        Ok(Message {
            id: Some(self.next_id.fetch_add(1, Ordering::SeqCst)),
            local_id: None,
            sender: identity.to_string(),
            receiver: peer.to_string(),
            content: content.to_string(),
            timestamp: Utc::now(),
            origin: Origin::Confirmed,
            failed: false,
        })
    }
}

// ─── Fixtures ────────────────────────────────────────────────────────────────

pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

pub fn remote(id: i64, sender: &str, receiver: &str, content: &str, secs: i64) -> Message {
    Message {
        id: Some(id),
        local_id: None,
        sender: sender.to_string(),
        receiver: receiver.to_string(),
        content: content.to_string(),
        timestamp: at(secs),
        origin: Origin::Remote,
        failed: false,
    }
}

/// `new_message` frame as the service pushes it (naive timestamp, `*_name` fields)
pub fn new_message_frame(id: i64, sender: &str, receiver: &str, content: &str, timestamp: DateTime<Utc>) -> serde_json::Value {
    json!({
        "type": "new_message",
        "id": id,
        "sender_name": sender,
        "receiver_name": receiver,
        "content": content,
        "timestamp": timestamp.naive_utc().format("%Y-%m-%dT%H:%M:%S%.6f").to_string(),
    })
}

pub fn users_frame(users: &[&str]) -> serde_json::Value {
    json!({ "type": "users_list", "users": users })
}

// ─── Waiting ─────────────────────────────────────────────────────────────────

pub async fn eventually<F>(session: &ChatSession, what: &str, check: F)
where
    F: Fn(&ConversationStore) -> bool,
{
    for _ in 0..500 {
        if check(&*session.store().await) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for: {}", what);
}

pub async fn wait_for_state(session: &ChatSession, state: ConnectionState) {
    for _ in 0..500 {
        if session.connection_state() == state {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("connection never reached {:?}", state);
}

pub async fn recv<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out")
        .expect("channel closed")
}
