//! HTTP behaviour of [`MdsClient`] against a local stub registrar.
//!
//! The stub accepts one connection per scripted reply, records what it was
//! sent and answers with `Connection: close` so every call opens a fresh
//! connection.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use igsn_core::{Allocation, MdsClient, Registrar, RegistrarError};

const IDENTIFIER: &str = "10273/XXAA1";
const LANDING_PAGE: &str = "https://example.org/igsn/10273/XXAA1";
const METADATA: &str = "<resource><identifier>10273/XXAA1</identifier></resource>";

// ── Stub registrar ─────────────────────────────────────────────

struct Reply {
    status: u16,
    body: &'static str,
    delay: Duration,
}

fn reply(status: u16, body: &'static str) -> Reply {
    Reply {
        status,
        body,
        delay: Duration::ZERO,
    }
}

#[derive(Debug, Clone)]
struct Received {
    /// `METHOD /path`
    line: String,
    authorization: Option<String>,
    body: String,
}

struct StubMds {
    url: String,
    received: Arc<Mutex<Vec<Received>>>,
}

impl StubMds {
    async fn start(replies: Vec<Reply>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/api/", listener.local_addr().unwrap());
        let received = Arc::new(Mutex::new(Vec::new()));
        let log = received.clone();
        tokio::spawn(async move {
            for reply in replies {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(serve(stream, reply, log.clone()));
            }
        });
        Self { url, received }
    }

    fn client(&self, timeout: Duration) -> MdsClient {
        let allocation = Allocation {
            id: "ardc-test".into(),
            prefix: "10273".into(),
            namespace: "XXAA".into(),
            mds_url: Some(self.url.clone()),
            username: Some("user".into()),
            password: Some("secret".into()),
            test_mode: true,
            landing_page_template: None,
        };
        MdsClient::new(&allocation, timeout).unwrap()
    }

    fn received(&self) -> Vec<Received> {
        self.received.lock().unwrap().clone()
    }

    fn lines(&self) -> Vec<String> {
        self.received().into_iter().map(|r| r.line).collect()
    }
}

async fn serve(mut stream: TcpStream, reply: Reply, log: Arc<Mutex<Vec<Received>>>) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let head_end = loop {
        let n = stream.read(&mut chunk).await.unwrap();
        if n == 0 {
            return;
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };
    let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
    let header = |name: &str| {
        head.lines().skip(1).find_map(|line| {
            let (key, value) = line.split_once(':')?;
            key.trim()
                .eq_ignore_ascii_case(name)
                .then(|| value.trim().to_string())
        })
    };
    let length = header("content-length")
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(0);
    while buf.len() < head_end + length {
        let n = stream.read(&mut chunk).await.unwrap();
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }

    let mut request_line = head.lines().next().unwrap_or_default().split_whitespace();
    let method = request_line.next().unwrap_or_default();
    let path = request_line.next().unwrap_or_default();
    log.lock().unwrap().push(Received {
        line: format!("{method} {path}"),
        authorization: header("authorization"),
        body: String::from_utf8_lossy(&buf[head_end..]).to_string(),
    });

    tokio::time::sleep(reply.delay).await;
    let response = format!(
        "HTTP/1.1 {} Stub\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
        reply.status,
        reply.body.len(),
        reply.body
    );
    let _ = stream.write_all(response.as_bytes()).await;
    let _ = stream.shutdown().await;
}

const TIMEOUT: Duration = Duration::from_secs(5);

// ── Minting ────────────────────────────────────────────────────

#[tokio::test]
async fn test_mode_mint_registers_without_attaching() {
    let mds = StubMds::start(vec![reply(201, "OK")]).await;
    mds.client(TIMEOUT)
        .mint_identifier(IDENTIFIER, LANDING_PAGE, METADATA, true)
        .await
        .unwrap();

    let received = mds.received();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].line, "POST /api/igsn");
    assert_eq!(
        received[0].body,
        format!("igsn={IDENTIFIER}\nurl={LANDING_PAGE}")
    );
    assert_eq!(
        received[0].authorization.as_deref(),
        Some("Basic dXNlcjpzZWNyZXQ=")
    );
}

#[tokio::test]
async fn live_mint_attaches_metadata_after_registering() {
    let mds = StubMds::start(vec![reply(201, "OK"), reply(201, "OK")]).await;
    mds.client(TIMEOUT)
        .mint_identifier(IDENTIFIER, LANDING_PAGE, METADATA, false)
        .await
        .unwrap();

    assert_eq!(mds.lines(), ["POST /api/igsn", "POST /api/metadata"]);
    assert_eq!(mds.received()[1].body, METADATA);
}

#[tokio::test]
async fn failed_registration_skips_the_attach() {
    let mds = StubMds::start(vec![reply(500, "boom"), reply(201, "OK")]).await;
    let err = mds
        .client(TIMEOUT)
        .mint_identifier(IDENTIFIER, LANDING_PAGE, METADATA, false)
        .await
        .unwrap_err();

    assert!(matches!(err, RegistrarError::Rejected { status: 500, .. }), "{err}");
    assert_eq!(mds.lines(), ["POST /api/igsn"]);
}

// ── Status classification ──────────────────────────────────────

#[tokio::test]
async fn only_created_counts_as_success_for_writes() {
    let mds = StubMds::start(vec![reply(200, "OK"), reply(200, "OK")]).await;
    let client = mds.client(TIMEOUT);

    let err = client
        .mint_identifier(IDENTIFIER, LANDING_PAGE, METADATA, true)
        .await
        .unwrap_err();
    assert!(matches!(err, RegistrarError::Rejected { status: 200, .. }), "{err}");
    assert!(!err.is_retryable());

    let err = client.attach_metadata(METADATA).await.unwrap_err();
    assert!(matches!(err, RegistrarError::Rejected { status: 200, .. }), "{err}");
}

#[tokio::test]
async fn rejection_carries_the_upstream_body() {
    let mds = StubMds::start(vec![reply(400, "[url] must be a valid URL")]).await;
    let err = mds
        .client(TIMEOUT)
        .attach_metadata(METADATA)
        .await
        .unwrap_err();

    match err {
        RegistrarError::Rejected { status, ref body } => {
            assert_eq!(status, 400);
            assert_eq!(body, "[url] must be a valid URL");
        }
        other => panic!("expected a rejection, got {other:?}"),
    }
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn gateway_errors_are_retryable() {
    for status in [502, 503, 504] {
        let mds = StubMds::start(vec![reply(status, "upstream down")]).await;
        let err = mds
            .client(TIMEOUT)
            .attach_metadata(METADATA)
            .await
            .unwrap_err();

        match err {
            RegistrarError::Unavailable { status: got, ref body } => {
                assert_eq!(got, status);
                assert_eq!(body, "upstream down");
            }
            ref other => panic!("{status}: expected unavailable, got {other:?}"),
        }
        assert!(err.is_retryable(), "{status}");
    }
}

#[tokio::test]
async fn slow_registrar_times_out() {
    let mds = StubMds::start(vec![Reply {
        status: 201,
        body: "OK",
        delay: Duration::from_secs(5),
    }])
    .await;
    let err = mds
        .client(Duration::from_millis(200))
        .mint_identifier(IDENTIFIER, LANDING_PAGE, METADATA, true)
        .await
        .unwrap_err();

    assert!(matches!(err, RegistrarError::Timeout(_)), "{err:?}");
    assert!(err.is_retryable());
}

#[tokio::test]
async fn refused_connection_is_a_retryable_transport_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}/api/", listener.local_addr().unwrap());
    drop(listener);

    let mds = StubMds {
        url,
        received: Arc::new(Mutex::new(Vec::new())),
    };
    let err = mds
        .client(TIMEOUT)
        .attach_metadata(METADATA)
        .await
        .unwrap_err();
    assert!(matches!(err, RegistrarError::Transport(_)), "{err:?}");
    assert!(err.is_retryable());
}

// ── Reads ──────────────────────────────────────────────────────

#[tokio::test]
async fn fetches_expect_ok() {
    let mds = StubMds::start(vec![
        reply(200, METADATA),
        reply(200, LANDING_PAGE),
        reply(404, "not found"),
    ])
    .await;
    let client = mds.client(TIMEOUT);

    assert_eq!(client.fetch_metadata(IDENTIFIER).await.unwrap(), METADATA);
    assert_eq!(client.fetch_landing_page(IDENTIFIER).await.unwrap(), LANDING_PAGE);
    let err = client.fetch_metadata(IDENTIFIER).await.unwrap_err();
    assert!(matches!(err, RegistrarError::Rejected { status: 404, .. }), "{err}");

    assert_eq!(
        mds.lines(),
        [
            "GET /api/metadata/10273/XXAA1",
            "GET /api/igsn/10273/XXAA1",
            "GET /api/metadata/10273/XXAA1",
        ]
    );
}
