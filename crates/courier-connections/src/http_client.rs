//! Outbound HTTP requests as a [`Connection`].
//!
//! The agent sends a `request` [`HttpMessage`]; the connection performs the
//! call in the background and queues a `response` envelope for `receive()`.

use crate::queue::InboundQueue;
use async_trait::async_trait;
use courier_types::config::ConnectionConfig;
use courier_types::{
    Address, Connection, ConnectionError, ConnectionResult, ConnectionState, ConnectionStatus,
    Envelope, PublicId, RoutingContext,
};
use reqwest::{Method, Url};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Connection id of the HTTP client transport.
pub const PUBLIC_ID: &str = "courier/http_client:0.1.0";

/// Sender address of every response envelope.
pub const HTTP_SERVER_SENDER: &str = "HTTP Server";

const DEFAULT_TIMEOUT_MS: u64 = 30_000;

const STATUS_BAD_REQUEST: u16 = 400;
const STATUS_REQUEST_TIMEOUT: u16 = 408;
const STATUS_INTERNAL_SERVER_ERROR: u16 = 500;

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

fn default_version() -> String {
    "HTTP/1.1".to_string()
}

/// Backend settings read from the `[connections.config]` table.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct HttpClientSettings {
    /// Host that relative request URLs resolve against.
    pub host: String,
    pub port: u16,
    /// Whole-request timeout. Expiry answers 408.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl HttpClientSettings {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }

    fn base_url(&self) -> ConnectionResult<Url> {
        Url::parse(&format!("http://{}:{}/", self.host, self.port)).map_err(|e| {
            ConnectionError::InvalidConfig(format!(
                "http client base {}:{}: {e}",
                self.host, self.port
            ))
        })
    }
}

/// Payload of an envelope on the HTTP protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpMessage {
    #[serde(default)]
    pub message_id: i64,
    /// Id of the message this one answers; 0 for a first message.
    #[serde(default)]
    pub target: i64,
    #[serde(flatten)]
    pub performative: HttpPerformative,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "performative", rename_all = "snake_case")]
pub enum HttpPerformative {
    Request {
        method: String,
        /// Absolute, or relative to the configured host and port.
        url: String,
        #[serde(default = "default_version")]
        version: String,
        #[serde(default)]
        headers: BTreeMap<String, String>,
        #[serde(default, with = "body_base64")]
        body: Vec<u8>,
    },
    Response {
        version: String,
        status_code: u16,
        status_text: String,
        #[serde(default)]
        headers: BTreeMap<String, String>,
        #[serde(default, with = "body_base64")]
        body: Vec<u8>,
    },
}

impl HttpMessage {
    /// A first `request` message with no headers or body.
    pub fn request(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            message_id: 1,
            target: 0,
            performative: HttpPerformative::Request {
                method: method.into(),
                url: url.into(),
                version: default_version(),
                headers: BTreeMap::new(),
                body: Vec::new(),
            },
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        match &mut self.performative {
            HttpPerformative::Request { headers, .. } | HttpPerformative::Response { headers, .. } => {
                headers.insert(name.into(), value.into());
            }
        }
        self
    }

    pub fn with_body(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        match &mut self.performative {
            HttpPerformative::Request { body, .. } | HttpPerformative::Response { body, .. } => {
                *body = bytes.into();
            }
        }
        self
    }

    pub fn encode(&self) -> Vec<u8> {
        // A struct of strings, integers and maps always serializes.
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn decode(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }

    pub fn performative_name(&self) -> &'static str {
        match self.performative {
            HttpPerformative::Request { .. } => "request",
            HttpPerformative::Response { .. } => "response",
        }
    }
}

mod body_base64 {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(d)?;
        base64::engine::general_purpose::STANDARD
            .decode(text.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

/// Outcome of one outbound call, already mapped to an HTTP status.
#[derive(Debug)]
struct Reply {
    version: String,
    status_code: u16,
    status_text: String,
    headers: BTreeMap<String, String>,
    body: Vec<u8>,
}

impl Reply {
    fn failure(status_code: u16, status_text: &str, reason: String) -> Self {
        Self {
            version: String::new(),
            status_code,
            status_text: status_text.to_string(),
            headers: BTreeMap::new(),
            body: reason.into_bytes(),
        }
    }

    fn into_message(self, request_id: i64) -> HttpMessage {
        HttpMessage {
            message_id: request_id + 1,
            target: request_id,
            performative: HttpPerformative::Response {
                version: self.version,
                status_code: self.status_code,
                status_text: self.status_text,
                headers: self.headers,
                body: self.body,
            },
        }
    }
}

async fn execute(
    client: &reqwest::Client,
    base: &Url,
    method: &str,
    url: &str,
    headers: &BTreeMap<String, String>,
    body: Vec<u8>,
) -> Reply {
    let method = match Method::from_bytes(method.to_ascii_uppercase().as_bytes()) {
        Ok(m) => m,
        Err(e) => {
            return Reply::failure(STATUS_BAD_REQUEST, "Bad Request", format!("{method}: {e}"))
        }
    };
    let url = match base.join(url) {
        Ok(u) => u,
        Err(e) => return Reply::failure(STATUS_BAD_REQUEST, "Bad Request", format!("{url}: {e}")),
    };

    let mut builder = client.request(method.clone(), url.clone());
    for (name, value) in headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    if !body.is_empty() {
        builder = builder.body(body);
    }

    let response = match builder.send().await {
        Ok(r) => r,
        Err(e) => return transport_failure(&method, &url, e),
    };
    let status = response.status();
    let version = format!("{:?}", response.version());
    let headers = response
        .headers()
        .iter()
        .map(|(k, v)| (k.to_string(), String::from_utf8_lossy(v.as_bytes()).into_owned()))
        .collect();
    match response.bytes().await {
        Ok(bytes) => Reply {
            version,
            status_code: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or_default().to_string(),
            headers,
            body: bytes.to_vec(),
        },
        Err(e) => transport_failure(&method, &url, e),
    }
}

fn transport_failure(method: &Method, url: &Url, e: reqwest::Error) -> Reply {
    if e.is_timeout() {
        warn!(%method, %url, "HTTP request timed out");
        Reply::failure(STATUS_REQUEST_TIMEOUT, "Request Timeout", e.to_string())
    } else {
        warn!(%method, %url, error = %e, "HTTP request failed");
        Reply::failure(
            STATUS_INTERNAL_SERVER_ERROR,
            "Internal Server Error",
            e.to_string(),
        )
    }
}

/// Transport that performs HTTP calls on behalf of the agent.
pub struct HttpClientConnection {
    state: ConnectionState,
    settings: HttpClientSettings,
    base: Url,
    client: reqwest::Client,
    responses: InboundQueue,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl HttpClientConnection {
    /// `address` is the agent on whose behalf requests are made.
    pub fn new(
        connection_id: PublicId,
        address: impl Into<Address>,
        settings: HttpClientSettings,
    ) -> ConnectionResult<Self> {
        let base = settings.base_url()?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(settings.timeout_ms))
            .build()
            .map_err(|e| ConnectionError::InvalidConfig(format!("http client: {e}")))?;
        Ok(Self {
            state: ConnectionState::new(connection_id, address.into()),
            settings,
            base,
            client,
            responses: InboundQueue::new(),
            tasks: std::sync::Mutex::new(Vec::new()),
        })
    }

    /// Build from a `[[connections]]` entry. `host` and `port` are required.
    pub fn from_config(
        config: &ConnectionConfig,
        address: impl Into<Address>,
    ) -> ConnectionResult<Self> {
        let settings: HttpClientSettings = config.settings()?;
        Ok(Self::new(config.connection_id.clone(), address, settings)?.with_filters(
            config.restricted_to_protocols.clone(),
            config.excluded_protocols.clone(),
        ))
    }

    pub fn with_filters(
        mut self,
        restricted_to_protocols: BTreeSet<PublicId>,
        excluded_protocols: BTreeSet<PublicId>,
    ) -> Self {
        self.state = ConnectionState::new(
            self.state.connection_id().clone(),
            self.state.address().clone(),
        )
        .with_filters(restricted_to_protocols, excluded_protocols);
        self
    }

    pub fn settings(&self) -> &HttpClientSettings {
        &self.settings
    }

    fn track(&self, handle: JoinHandle<()>) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.retain(|t| !t.is_finished());
        tasks.push(handle);
    }

    fn abort_requests(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|e| e.into_inner()));
        if !tasks.is_empty() {
            debug!(count = tasks.len(), "Aborting in-flight HTTP requests");
        }
        for task in tasks {
            task.abort();
        }
    }
}

#[async_trait]
impl Connection for HttpClientConnection {
    fn state(&self) -> &ConnectionState {
        &self.state
    }

    async fn connect(&self) -> ConnectionResult<()> {
        if self.state.is_connected() {
            return Ok(());
        }
        self.state.set_status(ConnectionStatus::Connecting);
        self.responses.open().await;
        self.state.set_status(ConnectionStatus::Connected);
        info!(connection = %self.state.connection_id(), base = %self.base, "HTTP client connection up");
        Ok(())
    }

    async fn disconnect(&self) -> ConnectionResult<()> {
        if self.state.is_disconnected() {
            return Ok(());
        }
        self.state.set_status(ConnectionStatus::Disconnecting);
        self.abort_requests();
        self.responses.close();
        self.state.set_status(ConnectionStatus::Disconnected);
        info!(connection = %self.state.connection_id(), "HTTP client connection down");
        Ok(())
    }

    async fn send(&self, envelope: Envelope) -> ConnectionResult<()> {
        self.state.ensure_sendable(&envelope)?;
        let message =
            HttpMessage::decode(envelope.message()).map_err(|e| ConnectionError::InvalidMessage {
                connection: self.state.connection_id().clone(),
                reason: e.to_string(),
            })?;

        let performative = message.performative_name();
        let request_id = message.message_id;
        let HttpPerformative::Request {
            method,
            url,
            headers,
            body,
            ..
        } = message.performative
        else {
            warn!(
                connection = %self.state.connection_id(),
                performative,
                "Dropping HTTP message that is not a request"
            );
            return Ok(());
        };

        let Some(tx) = self.responses.sender() else {
            return Err(ConnectionError::NotConnected(
                self.state.connection_id().clone(),
            ));
        };
        let client = self.client.clone();
        let base = self.base.clone();
        let agent = envelope.sender().clone();
        let protocol = envelope.protocol_id().clone();
        let context = RoutingContext::for_connection(self.state.connection_id().clone());
        debug!(%method, %url, request_id, "Dispatching HTTP request");

        let handle = tokio::spawn(async move {
            let reply = execute(&client, &base, &method, &url, &headers, body).await;
            let message = reply.into_message(request_id);
            match Envelope::new(agent, HTTP_SERVER_SENDER, protocol, message.encode()) {
                Ok(response) => {
                    if tx.send(response.with_context(context)).is_err() {
                        debug!(request_id, "HTTP response arrived after disconnect");
                    }
                }
                Err(e) => warn!(error = %e, "Could not build HTTP response envelope"),
            }
        });
        self.track(handle);
        Ok(())
    }

    async fn receive(&self) -> ConnectionResult<Option<Envelope>> {
        self.state.ensure_connected()?;
        Ok(self.responses.next().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Bytes;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::{get, post};
    use std::net::SocketAddr;

    const HTTP_PROTOCOL: &str = "courier/http:0.1.0";

    async fn serve() -> SocketAddr {
        let app = axum::Router::new()
            .route("/hello", get(|| async { "hi" }))
            .route("/echo", post(|body: Bytes| async move { body }))
            .route(
                "/header",
                get(|headers: HeaderMap| async move {
                    headers
                        .get("x-courier")
                        .map(|v| v.to_str().unwrap_or_default().to_string())
                        .unwrap_or_default()
                }),
            )
            .route("/teapot", get(|| async { (StatusCode::IM_A_TEAPOT, "short and stout") }))
            .route(
                "/slow",
                get(|| async {
                    tokio::time::sleep(Duration::from_secs(3)).await;
                    "late"
                }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    fn connection(addr: SocketAddr, timeout_ms: u64) -> HttpClientConnection {
        let settings = HttpClientSettings {
            host: addr.ip().to_string(),
            port: addr.port(),
            timeout_ms,
        };
        HttpClientConnection::new(PUBLIC_ID.parse().unwrap(), "agent", settings).unwrap()
    }

    fn request_envelope(message: &HttpMessage) -> Envelope {
        Envelope::new(
            "HTTP Server",
            "agent",
            HTTP_PROTOCOL.parse().unwrap(),
            message.encode(),
        )
        .unwrap()
    }

    async fn response(conn: &HttpClientConnection) -> (Envelope, u16, Vec<u8>) {
        let envelope = tokio::time::timeout(Duration::from_secs(10), conn.receive())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let message = HttpMessage::decode(envelope.message()).unwrap();
        match message.performative {
            HttpPerformative::Response {
                status_code, body, ..
            } => (envelope, status_code, body),
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[test]
    fn test_message_json_shape() {
        let msg = HttpMessage::request("get", "/x").with_body(b"\x00\x01".to_vec());
        let json: serde_json::Value = serde_json::from_slice(&msg.encode()).unwrap();
        assert_eq!(json["performative"], "request");
        assert_eq!(json["body"], "AAE=");
        assert_eq!(HttpMessage::decode(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn test_settings_require_host_and_port() {
        let mut config = ConnectionConfig::new(PUBLIC_ID.parse().unwrap());
        config.config = toml::from_str(r#"host = "127.0.0.1""#).unwrap();
        assert!(matches!(
            HttpClientConnection::from_config(&config, "agent"),
            Err(ConnectionError::InvalidConfig(_))
        ));

        config.config = toml::from_str("host = \"127.0.0.1\"\nport = 8000").unwrap();
        let conn = HttpClientConnection::from_config(&config, "agent").unwrap();
        assert_eq!(conn.settings().timeout_ms, 30_000);
    }

    #[tokio::test]
    async fn test_relative_get_resolves_against_host() {
        let addr = serve().await;
        let conn = connection(addr, 5000);
        conn.connect().await.unwrap();

        let request = HttpMessage::request("GET", "/hello");
        conn.send(request_envelope(&request)).await.unwrap();
        let (envelope, status, body) = response(&conn).await;
        assert_eq!(status, 200);
        assert_eq!(body, b"hi");
        assert_eq!(envelope.to().as_str(), "agent");
        assert_eq!(envelope.sender().as_str(), HTTP_SERVER_SENDER);
        assert_eq!(envelope.target_connection(), Some(conn.connection_id()));

        let message = HttpMessage::decode(envelope.message()).unwrap();
        assert_eq!(message.target, 1);
        conn.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_post_body_and_headers() {
        let addr = serve().await;
        let conn = connection(addr, 5000);
        conn.connect().await.unwrap();

        let echo = HttpMessage::request("post", format!("http://{addr}/echo"))
            .with_body(b"payload".to_vec());
        conn.send(request_envelope(&echo)).await.unwrap();
        let (_, status, body) = response(&conn).await;
        assert_eq!(status, 200);
        assert_eq!(body, b"payload");

        let header = HttpMessage::request("GET", "header").with_header("x-courier", "yes");
        conn.send(request_envelope(&header)).await.unwrap();
        let (_, _, body) = response(&conn).await;
        assert_eq!(body, b"yes");

        let teapot = HttpMessage::request("GET", "/teapot");
        conn.send(request_envelope(&teapot)).await.unwrap();
        let (_, status, _) = response(&conn).await;
        assert_eq!(status, 418);
    }

    #[tokio::test]
    async fn test_timeout_is_408() {
        let addr = serve().await;
        let conn = connection(addr, 200);
        conn.connect().await.unwrap();
        conn.send(request_envelope(&HttpMessage::request("GET", "/slow")))
            .await
            .unwrap();
        let (_, status, _) = response(&conn).await;
        assert_eq!(status, 408);
    }

    #[tokio::test]
    async fn test_unreachable_host_is_500() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let conn = connection(addr, 2000);
        conn.connect().await.unwrap();
        conn.send(request_envelope(&HttpMessage::request("GET", "/hello")))
            .await
            .unwrap();
        let (_, status, body) = response(&conn).await;
        assert_eq!(status, 500);
        assert!(!body.is_empty());
    }

    #[tokio::test]
    async fn test_bad_method_is_400() {
        let addr = serve().await;
        let conn = connection(addr, 2000);
        conn.connect().await.unwrap();
        conn.send(request_envelope(&HttpMessage::request("NOT A METHOD", "/hello")))
            .await
            .unwrap();
        let (_, status, _) = response(&conn).await;
        assert_eq!(status, 400);
    }

    #[tokio::test]
    async fn test_response_performative_is_dropped() {
        let addr = serve().await;
        let conn = connection(addr, 2000);
        conn.connect().await.unwrap();
        let stray = Reply::failure(200, "OK", String::new()).into_message(1);
        conn.send(request_envelope(&stray)).await.unwrap();
        let waited = tokio::time::timeout(Duration::from_millis(200), conn.receive()).await;
        assert!(waited.is_err());
    }

    #[tokio::test]
    async fn test_malformed_payload_is_rejected() {
        let addr = serve().await;
        let conn = connection(addr, 2000);
        conn.connect().await.unwrap();
        let envelope = Envelope::new(
            "HTTP Server",
            "agent",
            HTTP_PROTOCOL.parse().unwrap(),
            b"not json".to_vec(),
        )
        .unwrap();
        assert!(matches!(
            conn.send(envelope).await,
            Err(ConnectionError::InvalidMessage { .. })
        ));
    }

    #[tokio::test]
    async fn test_lifecycle_and_filters() {
        let addr = serve().await;
        let conn = connection(addr, 2000)
            .with_filters(BTreeSet::new(), [HTTP_PROTOCOL.parse().unwrap()].into());
        let request = request_envelope(&HttpMessage::request("GET", "/hello"));

        assert!(matches!(
            conn.send(request.clone()).await,
            Err(ConnectionError::NotConnected(_))
        ));
        conn.disconnect().await.unwrap();

        conn.connect().await.unwrap();
        conn.connect().await.unwrap();
        assert!(matches!(
            conn.send(request).await,
            Err(ConnectionError::ProtocolNotSupported { .. })
        ));

        conn.disconnect().await.unwrap();
        conn.disconnect().await.unwrap();
        assert_eq!(conn.status(), ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_disconnect_ends_pending_receive() {
        let addr = serve().await;
        let conn = std::sync::Arc::new(connection(addr, 5000));
        conn.connect().await.unwrap();
        conn.send(request_envelope(&HttpMessage::request("GET", "/slow")))
            .await
            .unwrap();

        let waiter = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.receive().await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        conn.disconnect().await.unwrap();
        let got = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(got.is_none());
    }
}
