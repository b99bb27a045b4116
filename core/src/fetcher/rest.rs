//! hyper client for the message store service
use super::HistoryService;
use crate::config::Config;
use crate::error::FetchError;
use crate::types::{ConversationSummary, Message};
use crate::wire::{HistoryResponse, OnlineUsersResponse, PostMessageBody, WireMessage, WireSummary};
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::CONTENT_TYPE;
use hyper::{Method, Request, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

/// `HistoryService` over plain HTTP/1.1
#[derive(Clone)]
pub struct HttpHistoryService {
    base_url: String,
    client: Client<HttpConnector, Full<Bytes>>,
}

impl HttpHistoryService {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            base_url,
            client: Client::builder(TokioExecutor::new()).build_http(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.api_base_url.clone())
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, FetchError> {
        let request = Request::builder()
            .method(Method::GET)
            .uri(self.url(path))
            .body(Full::new(Bytes::new()))
            .map_err(|e| FetchError::Permanent(format!("build request: {}", e)))?;
        self.execute(request).await
    }

    async fn execute<T: DeserializeOwned>(&self, request: Request<Full<Bytes>>) -> Result<T, FetchError> {
        let method = request.method().clone();
        let uri = request.uri().clone();
        let response = self.client.request(request).await.map_err(|e| {
            warn!(%method, %uri, "request failed: {}", e);
            FetchError::Transient(format!("{} {}: {}", method, uri, e))
        })?;

        let status = response.status();
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| FetchError::Transient(format!("read body: {}", e)))?
            .to_bytes();
        debug!(%method, %uri, %status, bytes = body.len(), "response received");

        if !status.is_success() {
            let detail = String::from_utf8_lossy(&body);
            return Err(classify_status(status, detail.trim()));
        }
        serde_json::from_slice(&body)
            .map_err(|e| FetchError::Permanent(format!("decode {} response: {}", uri, e)))
    }
}

/// 5xx, 408 and 429 are worth retrying; any other failure status is final
fn classify_status(status: StatusCode, detail: &str) -> FetchError {
    let message = if detail.is_empty() {
        status.to_string()
    } else {
        format!("{}: {}", status, detail)
    };
    if status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
    {
        FetchError::Transient(message)
    } else {
        FetchError::Permanent(message)
    }
}

#[async_trait]
impl HistoryService for HttpHistoryService {
    async fn fetch_summaries(&self, identity: &str) -> Result<Vec<ConversationSummary>, FetchError> {
        let path = format!("/chats/{}", urlencoding::encode(identity));
        let list: Vec<WireSummary> = self.get(&path).await?;
        Ok(list.into_iter().map(ConversationSummary::from).collect())
    }

    async fn fetch_history(&self, identity: &str, peer: &str) -> Result<Vec<Message>, FetchError> {
        let path = format!(
            "/messages/{}?with_user={}",
            urlencoding::encode(identity),
            urlencoding::encode(peer)
        );
        let response: HistoryResponse = self.get(&path).await?;
        Ok(response
            .messages
            .into_iter()
            .map(|m| m.into_message(identity))
            .collect())
    }

    async fn fetch_online_users(&self) -> Result<Vec<String>, FetchError> {
        let response: OnlineUsersResponse = self.get("/users/online").await?;
        Ok(response.users)
    }

    async fn post_message(
        &self,
        identity: &str,
        peer: &str,
        content: &str,
    ) -> Result<Message, FetchError> {
        let body = serde_json::to_vec(&PostMessageBody {
            content,
            receiver_name: peer,
        })
        .map_err(|e| FetchError::Permanent(format!("encode message: {}", e)))?;
        let request = Request::builder()
            .method(Method::POST)
            .uri(self.url("/messages/"))
            .header(CONTENT_TYPE, "application/json")
            .header("Username", identity)
            .body(Full::new(Bytes::from(body)))
            .map_err(|e| FetchError::Permanent(format!("build request: {}", e)))?;
        let created: WireMessage = self.execute(request).await?;
        Ok(created.into_message(identity))
    }
}
