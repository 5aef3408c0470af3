//! Raw HTTP responses the task service should never send, served from a bare
//! TCP listener so the body can be cut short mid-stream.

use std::net::SocketAddr;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use webnode_core::auth::{self, AuthError};
use webnode_core::gate::{GateError, TaskGateClient};
use webnode_core::register::{RegistrationClient, RegistrationError};
use webnode_core::{AccessCredential, ClientMetadata, Identity, NodeConfig};

/// Answers every connection with `200 OK`, a `Content-Length` larger than the
/// body actually written, then closes.
async fn truncating_server(body: &'static str) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                read_request(&mut stream).await;
                let head = format!(
                    "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\n\r\n",
                    body.len() + 200
                );
                let _ = stream.write_all(head.as_bytes()).await;
                let _ = stream.write_all(body.as_bytes()).await;
                let _ = stream.flush().await;
            });
        }
    });
    addr
}

async fn read_request(stream: &mut tokio::net::TcpStream) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        let Ok(n) = stream.read(&mut chunk).await else {
            return;
        };
        if n == 0 {
            return;
        }
        buf.extend_from_slice(&chunk[..n]);
        let text = String::from_utf8_lossy(&buf);
        if let Some(split) = text.find("\r\n\r\n") {
            let wanted = text[..split]
                .lines()
                .find_map(|line| {
                    let (name, value) = line.split_once(':')?;
                    name.eq_ignore_ascii_case("content-length")
                        .then(|| value.trim().parse::<usize>().ok())
                        .flatten()
                })
                .unwrap_or(0);
            if buf.len() >= split + 4 + wanted {
                return;
            }
        }
    }
}

fn gate_for(addr: SocketAddr) -> (TaskGateClient, ClientMetadata) {
    let config = NodeConfig::new(&format!("http://{addr}")).expect("config");
    let metadata = ClientMetadata::from_config(&config);
    (
        TaskGateClient::new(&config, &metadata).expect("gate"),
        metadata,
    )
}

#[test_timeout::tokio_timeout_test]
async fn truncated_registration_body_is_not_a_confirmation() {
    let addr = truncating_server(r#"{"code":5"#).await;
    let (gate, metadata) = gate_for(addr);
    let registrar = RegistrationClient::new(gate, metadata);
    let identity = Identity::generate("node@example.com", "hunter2");
    let access = AccessCredential::issued("access-1", 1);

    let err = registrar
        .announce(&access, &identity)
        .await
        .expect_err("a cut-off body must not count as registered");
    assert!(
        matches!(err, RegistrationError::Gateway(GateError::Http(_))),
        "unexpected error: {err:?}"
    );
}

#[test_timeout::tokio_timeout_test]
async fn truncated_login_body_surfaces_as_transport_error() {
    let addr = truncating_server(r#"{"code":0,"data":{"refresh_tok"#).await;
    let (gate, _) = gate_for(addr);
    let identity = Identity::generate("node@example.com", "hunter2");

    let err = auth::exchange(&gate, &identity)
        .await
        .expect_err("login body was cut short");
    assert!(
        matches!(err, AuthError::Gateway(GateError::Http(_))),
        "unexpected error: {err:?}"
    );
    assert!(!err.is_rejection());
}
