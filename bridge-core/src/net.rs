use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

/// An event produced by the transport layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The transport has successfully connected.
    Connected,
    /// A complete text message has been received from the server.
    MessageReceived(String),
    /// The connection was lost.
    Disconnected,
}

/// A message-oriented duplex connection.
/// The transport moves whole text messages and knows nothing about JSON-RPC.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends one text message to the server.
    async fn send(&self, message: &str) -> Result<(), anyhow::Error>;

    /// Closes the connection.
    async fn disconnect(&self);
}

/// A factory responsible for creating new transport instances.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Creates a new transport and returns it, along with a stream of events.
    async fn create_transport(
        &self,
    ) -> Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>), anyhow::Error>;
}

/// A simple structure to represent an HTTP request
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub url: String,
    pub method: String, // "GET", "POST" or "PUT"
    pub headers: HashMap<String, String>,
    pub body: Option<Vec<u8>>,
}

impl HttpRequest {
    fn with_method(method: &str, url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: method.to_string(),
            headers: HashMap::new(),
            body: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::with_method("GET", url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::with_method("POST", url)
    }

    pub fn put(url: impl Into<String>) -> Self {
        Self::with_method("PUT", url)
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_json(self, body: &serde_json::Value) -> Self {
        self.with_header("Content-Type", "application/json")
            .with_body(body.to_string().into_bytes())
    }
}

/// A simple structure for the HTTP response
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status_code: u16,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }

    pub fn json(&self) -> Result<serde_json::Value> {
        if self.body.is_empty() {
            return Ok(serde_json::Value::Null);
        }
        Ok(serde_json::from_slice(&self.body)?)
    }
}

/// Trait for executing HTTP requests in a runtime-agnostic way
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Executes a given HTTP request and returns the response.
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse>;
}
