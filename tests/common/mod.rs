//! Shared helpers for shoal integration tests.
//!
//! - Supervisor helpers drive a [`ClusterSupervisor`] over the in-memory
//!   [`RecordingControl`].
//! - [`GatedDispatcher`] holds requests until the test releases them, so a
//!   request can be kept in flight across a drain.
//! - [`RawClient`] speaks HTTP/1.1 over a bare `TcpStream`, which lets tests
//!   observe exactly when the server closes a socket.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use hyper::body::Incoming;
use hyper::{Request, Response};
use shoal::cluster::testing::RecordingControl;
use shoal::cluster::{ClusterSupervisor, Event, ExitStatus, Pid, SupervisorConfig};
use shoal::server::{self, Body, RequestDispatcher, SocketDrain};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{Semaphore, mpsc};
use tokio::time::timeout;

/// Upper bound for any single wait in these tests.
pub const WAIT: Duration = Duration::from_secs(5);

// =============================================================================
// Supervisor helpers
// =============================================================================

pub type TestSupervisor = ClusterSupervisor<RecordingControl>;

/// A started supervisor with `workers` forked (none listening yet).
pub fn supervisor(workers: usize) -> TestSupervisor {
    supervisor_with(workers, false)
}

pub fn supervisor_with(workers: usize, nodemon_compat: bool) -> TestSupervisor {
    let mut sup = ClusterSupervisor::new(
        SupervisorConfig {
            workers,
            nodemon_compat,
        },
        RecordingControl::new(),
    );
    sup.start().expect("start supervisor");
    sup
}

/// Pids of live workers, oldest first.
pub fn live_pids(sup: &TestSupervisor) -> Vec<Pid> {
    sup.workers().iter().map(|w| w.pid()).collect()
}

/// Report every not-yet-listening, not-disconnecting worker as listening.
pub fn bring_up(sup: &mut TestSupervisor) {
    let pids: Vec<Pid> = sup
        .workers()
        .iter()
        .filter(|w| !w.is_listening() && !w.is_disconnecting())
        .map(|w| w.pid())
        .collect();
    for pid in pids {
        sup.handle(Event::WorkerListening { pid }).expect("listening");
    }
}

/// Report a clean exit of `pid`.
pub fn exit(sup: &mut TestSupervisor, pid: Pid) -> shoal::cluster::Step {
    sup.handle(Event::WorkerExited {
        pid,
        status: ExitStatus::Code(0),
    })
    .expect("exit")
}

/// Pids that were told to disconnect, in order.
pub fn disconnected(sup: &TestSupervisor) -> Vec<Pid> {
    sup.control().disconnects().to_vec()
}

// =============================================================================
// HTTP helpers
// =============================================================================

/// Dispatcher that answers only after the test adds a permit.
pub struct GatedDispatcher {
    gate: Arc<Semaphore>,
    entered: mpsc::UnboundedSender<String>,
}

/// Test-side handle of a [`GatedDispatcher`].
pub struct Gate {
    gate: Arc<Semaphore>,
    entered: mpsc::UnboundedReceiver<String>,
}

impl GatedDispatcher {
    pub fn new() -> (Self, Gate) {
        let gate = Arc::new(Semaphore::new(0));
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                gate: gate.clone(),
                entered: tx,
            },
            Gate { gate, entered: rx },
        )
    }
}

impl Gate {
    /// Wait until a request reached the dispatcher; returns its path.
    pub async fn entered(&mut self) -> String {
        timeout(WAIT, self.entered.recv())
            .await
            .expect("request never reached the dispatcher")
            .expect("dispatcher dropped")
    }

    /// Let `n` held requests answer.
    pub fn release(&self, n: usize) {
        self.gate.add_permits(n);
    }
}

#[async_trait]
impl RequestDispatcher for GatedDispatcher {
    async fn dispatch(&self, request: Request<Incoming>) -> Response<Body> {
        let path = request.uri().path().to_string();
        let _ = self.entered.send(path.clone());
        if let Ok(permit) = self.gate.acquire().await {
            permit.forget();
        }
        Response::new(Body::new(Bytes::from(format!("done {path}"))))
    }
}

/// Bind an ephemeral port and serve `dispatcher` on it.
pub async fn serve<D: RequestDispatcher>(dispatcher: D) -> Arc<SocketDrain> {
    let listener = server::bind("127.0.0.1:0".parse().unwrap()).expect("bind");
    Arc::new(SocketDrain::serve(listener, Arc::new(dispatcher)).expect("serve"))
}

/// A parsed HTTP/1.1 response.
#[derive(Debug)]
pub struct RawResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl RawResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Minimal keep-alive HTTP/1.1 client.
pub struct RawClient {
    stream: BufReader<TcpStream>,
}

impl RawClient {
    pub async fn connect(addr: std::net::SocketAddr) -> Self {
        let stream = timeout(WAIT, TcpStream::connect(addr))
            .await
            .expect("connect timed out")
            .expect("connect");
        Self {
            stream: BufReader::new(stream),
        }
    }

    pub async fn send(&mut self, path: &str) {
        let request = format!("GET {path} HTTP/1.1\r\nHost: shoal.test\r\n\r\n");
        self.stream
            .get_mut()
            .write_all(request.as_bytes())
            .await
            .expect("write request");
    }

    pub async fn read_response(&mut self) -> RawResponse {
        timeout(WAIT, self.read_response_inner())
            .await
            .expect("response timed out")
    }

    async fn read_response_inner(&mut self) -> RawResponse {
        let mut line = String::new();
        self.stream.read_line(&mut line).await.expect("status line");
        let status = line
            .split_whitespace()
            .nth(1)
            .and_then(|code| code.parse().ok())
            .expect("status code");

        let mut headers = Vec::new();
        loop {
            line.clear();
            self.stream.read_line(&mut line).await.expect("header line");
            let trimmed = line.trim_end();
            if trimmed.is_empty() {
                break;
            }
            if let Some((key, value)) = trimmed.split_once(':') {
                headers.push((key.trim().to_string(), value.trim().to_string()));
            }
        }

        let length: usize = headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case("content-length"))
            .and_then(|(_, value)| value.parse().ok())
            .unwrap_or(0);
        let mut body = vec![0u8; length];
        self.stream.read_exact(&mut body).await.expect("body");

        RawResponse {
            status,
            headers,
            body: String::from_utf8(body).expect("utf-8 body"),
        }
    }

    /// True if the server closed the socket within [`WAIT`].
    pub async fn is_closed(&mut self) -> bool {
        let mut buf = [0u8; 64];
        matches!(timeout(WAIT, self.stream.read(&mut buf)).await, Ok(Ok(0) | Err(_)))
    }
}
