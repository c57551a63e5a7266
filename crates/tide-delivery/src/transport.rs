//! HTTP transport abstraction for webhook delivery.
//!
//! The delivery engine only needs "POST this JSON, tell me the status". Keeping
//! that behind a dyn-compatible trait allows:
//! - Scripted mock responses in tests
//! - A separate fallback transport with its own client settings

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::pin::Pin;
use std::time::Duration;

use crate::error::{DeliveryResult, TransportError};

/// Boxed future for dyn-compatible async trait methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;

/// Trait for posting JSON payloads to a webhook URL.
pub trait Transport: Send + Sync {
    /// POST `payload` to `url`, resolving to the HTTP status code.
    ///
    /// Any status, including non-2xx, is `Ok`; `Err` means no response was
    /// received.
    fn post<'a>(&'a self, url: &'a str, payload: &'a Value)
        -> BoxFuture<'a, Result<u16, TransportError>>;
}

/// Webhook transport backed by a pooled reqwest client.
///
/// The pool is shared across every destination the transport posts to.
#[derive(Debug, Clone)]
pub struct WebhookTransport {
    client: reqwest::Client,
}

impl WebhookTransport {
    /// Create a transport with a bounded idle-connection pool.
    pub fn new(pool_max_idle_per_host: usize, connect_timeout: Duration) -> DeliveryResult<Self> {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(pool_max_idle_per_host)
            .connect_timeout(connect_timeout)
            .user_agent(concat!("tide-bot/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }
}

impl Transport for WebhookTransport {
    fn post<'a>(
        &'a self,
        url: &'a str,
        payload: &'a Value,
    ) -> BoxFuture<'a, Result<u16, TransportError>> {
        Box::pin(async move {
            let response = self
                .client
                .post(url)
                .json(payload)
                .send()
                .await
                .map_err(classify_reqwest_error)?;
            Ok(response.status().as_u16())
        })
    }
}

fn classify_reqwest_error(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout
    } else if e.is_connect() {
        TransportError::Connect(e.to_string())
    } else if e.is_builder() {
        TransportError::Invalid(e.to_string())
    } else {
        TransportError::Io(e.to_string())
    }
}

/// A recorded mock POST.
#[derive(Debug, Clone)]
pub struct MockCall {
    pub url: String,
    pub payload: Value,
    /// Tokio time of the call, so paused-clock tests can measure backoff.
    pub at: tokio::time::Instant,
}

#[derive(Debug, Clone)]
struct MockStep {
    delay: Duration,
    result: Result<u16, TransportError>,
}

/// Mock transport for testing.
///
/// Replies with scripted results in order, then with the default result
/// (204 unless changed).
#[derive(Debug)]
pub struct MockTransport {
    script: Mutex<VecDeque<MockStep>>,
    default: Mutex<Result<u16, TransportError>>,
    calls: Mutex<Vec<MockCall>>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    /// Create a mock that answers 204 to everything.
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            default: Mutex::new(Ok(204)),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Replace the reply used once the script is exhausted.
    pub fn set_default(&self, result: Result<u16, TransportError>) {
        *self.default.lock() = result;
    }

    /// Queue a status reply.
    pub fn push_status(&self, status: u16) {
        self.push_delayed(Duration::ZERO, Ok(status));
    }

    /// Queue a transport error.
    pub fn push_error(&self, error: TransportError) {
        self.push_delayed(Duration::ZERO, Err(error));
    }

    /// Queue a reply that resolves after `delay`.
    pub fn push_delayed(&self, delay: Duration, result: Result<u16, TransportError>) {
        self.script.lock().push_back(MockStep { delay, result });
    }

    /// All calls so far.
    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Calls made to one URL.
    pub fn calls_to(&self, url: &str) -> Vec<MockCall> {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.url == url)
            .cloned()
            .collect()
    }
}

impl Transport for MockTransport {
    fn post<'a>(
        &'a self,
        url: &'a str,
        payload: &'a Value,
    ) -> BoxFuture<'a, Result<u16, TransportError>> {
        self.calls.lock().push(MockCall {
            url: url.to_string(),
            payload: payload.clone(),
            at: tokio::time::Instant::now(),
        });
        let step = self.script.lock().pop_front().unwrap_or_else(|| MockStep {
            delay: Duration::ZERO,
            result: self.default.lock().clone(),
        });

        Box::pin(async move {
            if !step.delay.is_zero() {
                tokio::time::sleep(step.delay).await;
            }
            step.result
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_mock_replays_script_then_default() {
        let mock = MockTransport::new();
        mock.push_status(503);
        mock.push_error(TransportError::Connect("refused".to_string()));

        let payload = json!({"content": "hi"});
        assert_eq!(mock.post("http://a", &payload).await, Ok(503));
        assert!(mock.post("http://a", &payload).await.is_err());
        assert_eq!(mock.post("http://b", &payload).await, Ok(204));

        assert_eq!(mock.call_count(), 3);
        assert_eq!(mock.calls_to("http://a").len(), 2);
    }

    #[test]
    fn test_transport_error_recoverability() {
        assert!(TransportError::Timeout.is_recoverable());
        assert!(TransportError::Io("reset".to_string()).is_recoverable());
        assert!(!TransportError::Invalid("bad header".to_string()).is_recoverable());
    }

    #[tokio::test]
    async fn test_webhook_transport_connect_refused_is_recoverable() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let transport = WebhookTransport::new(2, Duration::from_secs(1)).unwrap();
        let url = format!("http://127.0.0.1:{port}/webhook");
        let result = transport.post(&url, &json!({"content": "x"})).await;
        let err = result.unwrap_err();
        assert!(err.is_recoverable(), "unexpected error: {err:?}");
    }
}
