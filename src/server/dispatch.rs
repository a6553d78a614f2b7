//! Demo application served by `shoal` workers.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use hyper::body::Incoming;
use hyper::header::{CONTENT_TYPE, HeaderValue};
use hyper::{Request, Response};
use serde_json::json;

use super::{Body, RequestDispatcher};

/// Answers every request with the serving pid and the request path.
///
/// An optional delay makes in-flight requests observable during a drain.
#[derive(Debug, Clone, Copy, Default)]
pub struct HelloDispatcher {
    delay: Option<Duration>,
}

impl HelloDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self { delay: Some(delay) }
    }

    fn respond(&self, path: &str) -> Response<Body> {
        let body = json!({
            "pid": std::process::id(),
            "path": path,
        });
        let mut response = Response::new(Body::new(Bytes::from(body.to_string())));
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        response
    }
}

#[async_trait]
impl RequestDispatcher for HelloDispatcher {
    async fn dispatch(&self, request: Request<Incoming>) -> Response<Body> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.respond(request.uri().path())
    }
}
