//! Listener wrapper that shuts down by draining open connections.
//!
//! ```text
//! Normal ──shutdown()──► ShutdownRequested ──listener closed──► Draining
//!                                                                  │
//!                                          last connection closed  ▼
//!                                                               Closed
//! ```
//!
//! While `Normal`, connections are accepted and kept alive as usual. Once
//! shutdown is requested the listener is dropped, idle keep-alive sockets
//! are closed right away, and every connection still carrying a request
//! gets to finish it: the response goes out with `Connection: close` and the
//! socket is closed after it is written.

use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use hyper::header::{CONNECTION, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::RequestDispatcher;
use crate::error::{Error, Result};

/// Pause before accepting again after a non-transient accept error
/// (e.g. `EMFILE`), so fd exhaustion does not spin the loop.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Lifecycle of a [`SocketDrain`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DrainState {
    Normal,
    ShutdownRequested,
    Draining,
    Closed,
}

/// Counters shared by the accept loop and connection tasks.
#[derive(Debug)]
struct Counters {
    connections: watch::Sender<usize>,
    in_flight: AtomicUsize,
}

/// Decrements the open connection count when a connection task ends.
struct ConnectionGuard(Arc<Counters>);

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.0.connections.send_modify(|n| *n = n.saturating_sub(1));
    }
}

/// Decrements the in-flight request count when a dispatch finishes.
struct RequestGuard(Arc<Counters>);

impl RequestGuard {
    fn enter(counters: &Arc<Counters>) -> Self {
        counters.in_flight.fetch_add(1, Ordering::AcqRel);
        Self(counters.clone())
    }
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

/// An HTTP/1 server that can be shut down without cutting requests short.
#[derive(Debug)]
pub struct SocketDrain {
    local_addr: SocketAddr,
    state: watch::Sender<DrainState>,
    counters: Arc<Counters>,
    accept_loop: Mutex<Option<JoinHandle<()>>>,
}

impl SocketDrain {
    /// Start accepting on `listener`, handing each request to `dispatcher`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn serve<D: RequestDispatcher>(listener: TcpListener, dispatcher: Arc<D>) -> Result<Self> {
        let local_addr = listener
            .local_addr()
            .map_err(|e| Error::io("reading listener address", e))?;
        let (state, _) = watch::channel(DrainState::Normal);
        let (connections, _) = watch::channel(0);
        let counters = Arc::new(Counters {
            connections,
            in_flight: AtomicUsize::new(0),
        });

        let accept_loop = tokio::spawn(accept_loop(
            listener,
            dispatcher,
            state.subscribe(),
            counters.clone(),
        ));

        Ok(Self {
            local_addr,
            state,
            counters,
            accept_loop: Mutex::new(Some(accept_loop)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn state(&self) -> DrainState {
        *self.state.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> watch::Receiver<DrainState> {
        self.state.subscribe()
    }

    /// Connections currently open.
    pub fn active_connections(&self) -> usize {
        *self.counters.connections.borrow()
    }

    /// Requests currently being dispatched.
    pub fn in_flight_requests(&self) -> usize {
        self.counters.in_flight.load(Ordering::Acquire)
    }

    /// Stop accepting, drain open connections and resolve once all are gone.
    ///
    /// Calling it again (or concurrently) waits for the same drain.
    pub async fn shutdown(&self) -> Result<()> {
        let requested = self.state.send_if_modified(|state| {
            if *state == DrainState::Normal {
                *state = DrainState::ShutdownRequested;
                true
            } else {
                false
            }
        });
        if requested {
            info!(
                addr = %self.local_addr,
                connections = self.active_connections(),
                "Shutdown requested, draining connections"
            );
        }

        let accept_loop = self.accept_loop.lock().take();
        if let Some(task) = accept_loop {
            task.await
                .map_err(|e| Error::io("stopping accept loop", std::io::Error::other(e)))?;
        }

        self.state.send_if_modified(|state| {
            if *state == DrainState::ShutdownRequested {
                *state = DrainState::Draining;
                true
            } else {
                false
            }
        });

        let mut connections = self.counters.connections.subscribe();
        // The sender lives in `self`, so this can't observe a closed channel.
        let _ = connections.wait_for(|n| *n == 0).await;

        let closed = self.state.send_if_modified(|state| {
            if *state == DrainState::Closed {
                false
            } else {
                *state = DrainState::Closed;
                true
            }
        });
        if closed {
            info!(addr = %self.local_addr, "Server closed");
        }
        Ok(())
    }

    /// Start a drain in the background and run `callback` once it finished.
    ///
    /// The callback never runs before this call returns.
    pub fn shutdown_with<F>(self: &Arc<Self>, callback: F)
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        let drain = self.clone();
        tokio::spawn(async move {
            let result = drain.shutdown().await;
            callback(result);
        });
    }
}

async fn accept_loop<D: RequestDispatcher>(
    listener: TcpListener,
    dispatcher: Arc<D>,
    mut state: watch::Receiver<DrainState>,
    counters: Arc<Counters>,
) {
    loop {
        tokio::select! {
            biased;
            () = shutdown_requested(&mut state) => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    counters.connections.send_modify(|n| *n += 1);
                    let guard = ConnectionGuard(counters.clone());
                    tokio::spawn(serve_connection(
                        stream,
                        remote,
                        dispatcher.clone(),
                        state.clone(),
                        guard,
                    ));
                },
                Err(e) if is_transient_accept_error(&e) => {
                    debug!(error = %e, "Transient accept error");
                },
                Err(e) => {
                    warn!(error = %e, "Failed to accept connection, backing off");
                    tokio::select! {
                        biased;
                        () = shutdown_requested(&mut state) => break,
                        () = tokio::time::sleep(ACCEPT_ERROR_BACKOFF) => {},
                    }
                },
            },
        }
    }
    debug!("Listener closed");
}

/// Errors that concern one half-open connection, not the listener.
fn is_transient_accept_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
    )
}

/// Resolves once the drain leaves `Normal` (or the drain is gone).
async fn shutdown_requested(state: &mut watch::Receiver<DrainState>) {
    let _ = state.wait_for(|s| *s != DrainState::Normal).await;
}

async fn serve_connection<D: RequestDispatcher>(
    stream: TcpStream,
    remote: SocketAddr,
    dispatcher: Arc<D>,
    mut state: watch::Receiver<DrainState>,
    guard: ConnectionGuard,
) {
    let counters = guard.0.clone();
    let request_state = state.clone();
    let service = service_fn(move |request| {
        let dispatcher = dispatcher.clone();
        let state = request_state.clone();
        let counters = counters.clone();
        async move {
            let _request = RequestGuard::enter(&counters);
            let mut response = dispatcher.dispatch(request).await;
            if *state.borrow() != DrainState::Normal {
                response
                    .headers_mut()
                    .insert(CONNECTION, HeaderValue::from_static("close"));
            }
            Ok::<_, Infallible>(response)
        }
    });

    let conn = http1::Builder::new().serve_connection(TokioIo::new(stream), service);
    tokio::pin!(conn);

    let result = tokio::select! {
        result = conn.as_mut() => result,
        () = shutdown_requested(&mut state) => {
            // Idle sockets close now, busy ones after their response.
            conn.as_mut().graceful_shutdown();
            conn.as_mut().await
        },
    };
    if let Err(e) = result
        && !e.is_incomplete_message()
    {
        debug!(remote = %remote, error = %e, "Connection error");
    }
    drop(guard);
}
