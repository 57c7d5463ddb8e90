//! One multiplexer over all three transports, built from a transport file.

use axum::routing::get;
use courier_connections::{
    HttpClientConnection, HttpMessage, HttpPerformative, MetricsConnection, MetricsMessage,
    MetricsPerformative, Multiplexer,
};
use courier_types::config::load_transport_config;
use courier_types::{Connection, Envelope, PublicId, RoutingContext};
use courier_wire::OverlayConnection;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_test::assert_ok;

const AGENT: &str = "agent";

async fn serve_http() -> SocketAddr {
    let app = axum::Router::new().route("/status", get(|| async { "all good" }));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn write_transport_file(dir: &Path, http: SocketAddr) -> std::path::PathBuf {
    let contents = format!(
        r#"
[[connections]]
connection_id = "courier/p2p_overlay:0.1.0"
excluded_protocols = ["courier/http:0.1.0", "courier/prometheus:0.1.0"]

[connections.config]
host = "127.0.0.1"
port = 9000
log_file = "{log}"
node_program = "sh"
node_args = ["-c", 'exec 3>"$NODE_TO_AGENT"; exec 4<"$AGENT_TO_NODE"; exec cat <&4 >&3']
runtime = "sh"
fetch_command = ["true"]
pipe_open_attempts = 40
pipe_open_backoff_ms = 50
shutdown_grace_ms = 1000

[[connections]]
connection_id = "courier/http_client:0.1.0"
restricted_to_protocols = ["courier/http:0.1.0"]

[connections.config]
host = "{host}"
port = {port}
timeout_ms = 5000

[[connections]]
connection_id = "courier/metrics:0.1.0"
restricted_to_protocols = ["courier/prometheus:0.1.0"]
"#,
        log = dir.join("node.log").display(),
        host = http.ip(),
        port = http.port(),
    );
    let path = dir.join("transport.toml");
    std::fs::write(&path, contents).unwrap();
    path
}

fn routed(to: &str, protocol: &str, body: Vec<u8>, connection: &PublicId) -> Envelope {
    Envelope::new(to, AGENT, protocol.parse().unwrap(), body)
        .unwrap()
        .with_context(RoutingContext::for_connection(connection.clone()))
}

#[tokio::test]
async fn test_multiplexer_over_all_transports() {
    let dir = tempfile::tempdir().unwrap();
    let http = serve_http().await;
    let transport = load_transport_config(&write_transport_file(dir.path(), http)).unwrap();
    assert_eq!(transport.connections.len(), 3);

    let overlay_id: PublicId = courier_wire::PUBLIC_ID.parse().unwrap();
    let http_id: PublicId = courier_connections::http_client::PUBLIC_ID.parse().unwrap();
    let metrics_id: PublicId = courier_connections::metrics::PUBLIC_ID.parse().unwrap();

    let overlay = Arc::new(
        OverlayConnection::from_config(transport.connection(&overlay_id).unwrap()).unwrap(),
    );
    let overlay_address = overlay.address().to_string();
    let connections: Vec<Arc<dyn Connection>> = vec![
        overlay,
        Arc::new(
            HttpClientConnection::from_config(transport.connection(&http_id).unwrap(), AGENT)
                .unwrap(),
        ),
        Arc::new(
            MetricsConnection::from_config(transport.connection(&metrics_id).unwrap(), AGENT)
                .unwrap(),
        ),
    ];
    let mux = Multiplexer::new(connections).unwrap();
    assert_eq!(mux.default_connection(), &overlay_id);
    assert_ok!(mux.connect_all().await);
    assert!(mux.is_connected());

    // The echo node hands the envelope straight back; no context means the
    // default (overlay) route.
    let ping = Envelope::new(
        overlay_address.as_str(),
        overlay_address.as_str(),
        "courier/default:0.1.0".parse().unwrap(),
        b"ping".to_vec(),
    )
    .unwrap();
    assert_ok!(mux.put(ping).await);

    let request = HttpMessage::request("GET", "/status");
    assert_ok!(
        mux.put(routed("HTTP Server", "courier/http:0.1.0", request.encode(), &http_id))
            .await
    );

    let add = MetricsMessage::add_metric("Counter", "pings", "Pings sent");
    assert_ok!(
        mux.put(routed(
            courier_connections::metrics::PUBLIC_ID,
            "courier/prometheus:0.1.0",
            add.encode(),
            &metrics_id,
        ))
        .await
    );

    let mut by_protocol = HashMap::new();
    for _ in 0..3 {
        let envelope = tokio::time::timeout(Duration::from_secs(10), mux.get())
            .await
            .unwrap()
            .unwrap();
        by_protocol.insert(envelope.protocol_id().to_string(), envelope);
    }

    let echoed = &by_protocol["courier/default:0.1.0"];
    assert_eq!(echoed.message(), b"ping");
    assert_eq!(echoed.to().as_str(), overlay_address);

    let response = HttpMessage::decode(by_protocol["courier/http:0.1.0"].message()).unwrap();
    match response.performative {
        HttpPerformative::Response {
            status_code, body, ..
        } => {
            assert_eq!(status_code, 200);
            assert_eq!(body, b"all good");
        }
        other => panic!("expected response, got {other:?}"),
    }

    let metric = MetricsMessage::decode(by_protocol["courier/prometheus:0.1.0"].message()).unwrap();
    assert!(matches!(
        metric.performative,
        MetricsPerformative::Response { code: 200, .. }
    ));

    // Protocol filters still apply behind the multiplexer.
    let misrouted = routed(
        "HTTP Server",
        "courier/http:0.1.0",
        HttpMessage::request("GET", "/status").encode(),
        &overlay_id,
    );
    assert!(mux.put(misrouted).await.is_err());

    mux.disconnect_all().await;
    assert!(mux
        .connections()
        .iter()
        .all(|c| c.state().is_disconnected()));
}
