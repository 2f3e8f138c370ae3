//! Tower middleware binding a causal context around every request.
//!
//! The layer sits in front of any `tower::Service` over `http` types
//! (axum routers, hyper services, tonic stacks). On request entry it
//! reconstructs the upstream causal state from the propagation headers,
//! binds a fresh context for the lifetime of the request future, and
//! captures the `HttpRequest`/`HttpResponse` pair with the request
//! duration. The bound [`ContextCell`] is also inserted into the request
//! extensions so handlers can reach it directly.
//!
//! ```rust,ignore
//! let app = axum::Router::new()
//!     .route("/transfer", axum::routing::post(transfer))
//!     .layer(raceway_agent::RacewayLayer::new(agent.clone()));
//! ```

use std::future::Future;
use std::pin::Pin;
use std::task::{self, Poll};
use std::time::Instant;

use http::{Request, Response};
use tower::{Layer, Service};

use crate::carrier::ContextExt;
use crate::context::ContextCell;
use crate::Agent;

/// Wraps services in a [`RacewayService`].
#[derive(Clone, Debug)]
pub struct RacewayLayer {
    agent: Agent,
}

impl RacewayLayer {
    pub fn new(agent: Agent) -> Self {
        Self { agent }
    }
}

impl<S> Layer<S> for RacewayLayer {
    type Service = RacewayService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RacewayService {
            inner,
            agent: self.agent.clone(),
        }
    }
}

/// Middleware that manages the causal context for each request it serves.
#[derive(Clone, Debug)]
pub struct RacewayService<S> {
    inner: S,
    agent: Agent,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for RacewayService<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>>,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
    ResBody: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<S::Response, S::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut task::Context<'_>) -> Poll<Result<(), S::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut request: Request<ReqBody>) -> Self::Future {
        let agent = self.agent.clone();
        let ctx = agent.parse_headers(
            request
                .headers()
                .iter()
                .map(|(name, value)| (name.as_str(), value.to_str().unwrap_or(""))),
        );
        let cell = ContextCell::new(ctx);
        request.extensions_mut().insert(cell.clone());

        let method = request.method().to_string();
        let path = request.uri().path().to_owned();
        let future = self.inner.call(request);

        Box::pin(
            async move {
                let started = Instant::now();
                agent.track_http_request(&method, &path, None, None);
                let response = future.await;
                let duration_ms = started.elapsed().as_millis() as u64;
                if let Ok(response) = &response {
                    agent.track_http_response(response.status().as_u16(), None, None, duration_ms);
                }
                response
            }
            .in_context(cell),
        )
    }
}
