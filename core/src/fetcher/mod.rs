//! Pull side: history, summaries, online users and the REST send
use crate::error::FetchError;
use crate::types::{ConversationSummary, Message};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

mod rest;

pub use rest::HttpHistoryService;

/// Request/response calls against the message store service
#[async_trait]
pub trait HistoryService: Send + Sync + 'static {
    async fn fetch_summaries(&self, identity: &str) -> Result<Vec<ConversationSummary>, FetchError>;

    /// Backlog with `peer`, in whatever order the service returns it
    async fn fetch_history(&self, identity: &str, peer: &str) -> Result<Vec<Message>, FetchError>;

    async fn fetch_online_users(&self) -> Result<Vec<String>, FetchError>;

    /// Create a message on the service; returns the stored record
    async fn post_message(
        &self,
        identity: &str,
        peer: &str,
        content: &str,
    ) -> Result<Message, FetchError>;
}

/// Bounds every call by the request timeout and normalises history ordering
#[derive(Clone)]
pub struct HistoryFetcher {
    service: Arc<dyn HistoryService>,
    request_timeout: Duration,
}

impl HistoryFetcher {
    pub fn new(service: Arc<dyn HistoryService>, request_timeout: Duration) -> Self {
        Self {
            service,
            request_timeout,
        }
    }

    async fn bounded<T>(
        &self,
        what: &str,
        call: impl Future<Output = Result<T, FetchError>>,
    ) -> Result<T, FetchError> {
        tokio::time::timeout(self.request_timeout, call)
            .await
            .map_err(|_| {
                FetchError::Transient(format!("{} timed out after {:?}", what, self.request_timeout))
            })?
    }

    pub async fn fetch_summaries(&self, identity: &str) -> Result<Vec<ConversationSummary>, FetchError> {
        self.bounded("summaries", self.service.fetch_summaries(identity)).await
    }

    /// Backlog with `peer`, ascending by timestamp.
    ///
    /// Resolves to `Cancelled` as soon as `token` fires.
    pub async fn fetch_history(
        &self,
        identity: &str,
        peer: &str,
        token: &CancellationToken,
    ) -> Result<Vec<Message>, FetchError> {
        let call = self.bounded("history", self.service.fetch_history(identity, peer));
        let mut messages = tokio::select! {
            biased;
            _ = token.cancelled() => {
                debug!(%peer, "history fetch cancelled");
                return Err(FetchError::Cancelled);
            }
            result = call => result?,
        };
        if token.is_cancelled() {
            return Err(FetchError::Cancelled);
        }
        // Service order is newest first
        messages.sort_by_key(|m| m.timestamp);
        Ok(messages)
    }

    pub async fn fetch_online_users(&self) -> Result<Vec<String>, FetchError> {
        self.bounded("online users", self.service.fetch_online_users()).await
    }

    pub async fn post_message(
        &self,
        identity: &str,
        peer: &str,
        content: &str,
    ) -> Result<Message, FetchError> {
        self.bounded("send", self.service.post_message(identity, peer, content))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Origin;
    use chrono::{TimeZone, Utc};

    struct Fixed {
        history: Vec<Message>,
        delay: Duration,
    }

    fn msg(id: i64, secs: i64) -> Message {
        Message {
            id: Some(id),
            local_id: None,
            sender: "bob".to_string(),
            receiver: "alice".to_string(),
            content: format!("m{}", id),
            timestamp: Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap(),
            origin: Origin::Remote,
            failed: false,
        }
    }

    #[async_trait]
    impl HistoryService for Fixed {
        async fn fetch_summaries(&self, _: &str) -> Result<Vec<ConversationSummary>, FetchError> {
            Ok(Vec::new())
        }

        async fn fetch_history(&self, _: &str, _: &str) -> Result<Vec<Message>, FetchError> {
            tokio::time::sleep(self.delay).await;
            Ok(self.history.clone())
        }

        async fn fetch_online_users(&self) -> Result<Vec<String>, FetchError> {
            Err(FetchError::Permanent("404".to_string()))
        }

        async fn post_message(&self, _: &str, _: &str, _: &str) -> Result<Message, FetchError> {
            Err(FetchError::Transient("503".to_string()))
        }
    }

    fn fetcher(delay: Duration) -> HistoryFetcher {
        let service = Fixed {
            history: vec![msg(3, 30), msg(2, 20), msg(1, 10)],
            delay,
        };
        HistoryFetcher::new(Arc::new(service), Duration::from_secs(10))
    }

    #[tokio::test]
    async fn test_history_sorted_ascending() {
        let token = CancellationToken::new();
        let history = fetcher(Duration::ZERO)
            .fetch_history("alice", "bob", &token)
            .await
            .unwrap();
        let ids: Vec<_> = history.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![Some(1), Some(2), Some(3)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_fetch_resolves_cancelled() {
        let fetcher = fetcher(Duration::from_secs(5));
        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            canceller.cancel();
        });
        let result = fetcher.fetch_history("alice", "bob", &token).await;
        assert_eq!(result, Err(FetchError::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_transient() {
        let fetcher = HistoryFetcher::new(
            Arc::new(Fixed {
                history: Vec::new(),
                delay: Duration::from_secs(60),
            }),
            Duration::from_secs(10),
        );
        let token = CancellationToken::new();
        let err = fetcher.fetch_history("alice", "bob", &token).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_errors_pass_through() {
        let fetcher = fetcher(Duration::ZERO);
        assert!(!fetcher.fetch_online_users().await.unwrap_err().is_transient());
        assert!(fetcher
            .post_message("alice", "bob", "hi")
            .await
            .unwrap_err()
            .is_transient());
    }
}
