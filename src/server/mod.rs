//! HTTP serving for workers.
//!
//! Every worker binds the same address with `SO_REUSEPORT`, so the kernel
//! spreads incoming connections over all listening workers and a worker that
//! stops accepting simply drops out of the rotation.
//!
//! - [`SocketDrain`] owns the accept loop and the connection-draining
//!   shutdown.
//! - [`RequestDispatcher`] is the application seam: one call per request.
//! - [`HelloDispatcher`] is the bundled demo application.

mod dispatch;
mod drain;

use std::net::SocketAddr;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::{Request, Response};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::TcpListener;

use crate::error::{Error, Result};

pub use dispatch::HelloDispatcher;
pub use drain::{DrainState, SocketDrain};

/// Response body type produced by dispatchers.
pub type Body = Full<Bytes>;

/// Pending connections the kernel queues per listener.
const LISTEN_BACKLOG: i32 = 1024;

/// Application request handler.
#[async_trait]
pub trait RequestDispatcher: Send + Sync + 'static {
    async fn dispatch(&self, request: Request<Incoming>) -> Response<Body>;
}

/// Bind a listener that shares `addr` with the other workers.
///
/// Must be called from within a Tokio runtime.
pub fn bind(addr: SocketAddr) -> Result<TcpListener> {
    let bind_err = |source| Error::Bind { addr, source };

    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(bind_err)?;
    socket.set_reuse_address(true).map_err(bind_err)?;
    #[cfg(all(unix, not(target_os = "solaris"), not(target_os = "illumos")))]
    socket.set_reuse_port(true).map_err(bind_err)?;
    socket.set_nonblocking(true).map_err(bind_err)?;
    socket.bind(&addr.into()).map_err(bind_err)?;
    socket.listen(LISTEN_BACKLOG).map_err(bind_err)?;

    TcpListener::from_std(socket.into()).map_err(bind_err)
}
