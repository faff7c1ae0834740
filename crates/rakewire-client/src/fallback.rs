//! Polling fallback.
//!
//! When the realtime connection cannot be re-established the client keeps
//! dashboards fresh by polling an equivalent REST endpoint.

use crate::traits::ClientError;
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

/// Default interval between polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Fetches a snapshot of the data the realtime channels would have pushed.
#[async_trait]
pub trait Poller: Send + Sync {
    /// Fetch one snapshot.
    async fn poll(&self) -> Result<Value, ClientError>;
}

/// Polls a JSON endpoint over HTTP.
#[cfg(feature = "polling")]
#[derive(Clone)]
pub struct HttpPoller {
    url: String,
    token: Option<String>,
    http: reqwest::Client,
}

#[cfg(feature = "polling")]
impl HttpPoller {
    /// Create a poller for `url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(url: impl Into<String>) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ClientError::PollFailed(e.to_string()))?;
        Ok(Self {
            url: url.into(),
            token: None,
            http,
        })
    }

    /// Send a bearer token with every poll.
    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }
}

#[cfg(feature = "polling")]
#[async_trait]
impl Poller for HttpPoller {
    async fn poll(&self) -> Result<Value, ClientError> {
        let mut request = self.http.get(&self.url);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ClientError::PollFailed(e.to_string()))?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(ClientError::Unauthorized);
        }

        response
            .error_for_status()
            .map_err(|e| ClientError::PollFailed(e.to_string()))?
            .json::<Value>()
            .await
            .map_err(|e| ClientError::PollFailed(e.to_string()))
    }
}

#[cfg(all(test, feature = "polling"))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_poll_unreachable_endpoint() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let poller = HttpPoller::new(format!("http://127.0.0.1:{port}/api/tracking"))
            .unwrap()
            .with_token("t");
        assert!(matches!(
            poller.poll().await,
            Err(ClientError::PollFailed(_))
        ));
    }
}
