//! # Logged HTTP
//!
//! An Axum middleware that tags every request with diagnostic fields and logs
//! one "received" and one "processed" line per request, optionally with the
//! request and response bodies. Bodies are captured while they stream, up to
//! a configured size, and go through redaction filters before being logged.
//!
//! ## Features
//!
//! - **Stream-aware**: bodies are teed while they flow, never buffered upfront
//! - **Bounded**: at most `limit` bytes of each body are kept for logging
//! - **Declarative**: logging is declared per resource, contract and operation,
//!   and resolved once per route
//! - **Redaction**: named filters mask sensitive values before logging
//! - **Scoped fields**: every diagnostic field of a request is cleared when it
//!   ends, whatever the exit path
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use axum::{routing::post, Router};
//! use logged_http::{
//!     BodyDeclaration, BodyFilter, FieldMask, FilterRegistry, LogMode, Logged, LoggedLayer,
//!     OperationDeclarations, RequestLogger, ResourceDeclarations,
//! };
//! use std::sync::Arc;
//!
//! async fn create(body: String) -> String {
//!     body
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let filters = FilterRegistry::new().register("secret", || {
//!         Ok(Arc::new(FieldMask::new(["secret-code"])?) as Arc<dyn BodyFilter>)
//!     });
//!     let logger = Arc::new(RequestLogger::builder().filters(filters).build());
//!
//!     let articles = ResourceDeclarations::new("ArticleResource").with_operation(
//!         OperationDeclarations::new("create").logged(
//!             Logged::new().with_body(
//!                 BodyDeclaration::new([LogMode::Log, LogMode::Context]).with_filter("secret"),
//!             ),
//!         ),
//!     );
//!
//!     let app = Router::new().route(
//!         "/articles",
//!         post(create).layer(LoggedLayer::for_operation(logger.clone(), &articles, "create")),
//!     );
//!
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:3000").await.unwrap();
//!     axum::serve(listener, app).await.unwrap();
//! }
//! ```
//!
//! ## Custom Sinks
//!
//! Lines go to `tracing` by default. Implement [`LogSink`] to send them
//! elsewhere:
//!
//! ```rust
//! use logged_http::{LogSink, RequestLogger};
//! use std::collections::BTreeMap;
//!
//! struct Stderr;
//!
//! impl LogSink for Stderr {
//!     fn info(&self, line: &str, context: &BTreeMap<String, String>) {
//!         eprintln!("{line} {context:?}");
//!     }
//! }
//!
//! let logger = RequestLogger::builder().sink(Stderr).build();
//! ```

use axum::{
    body::Body,
    extract::{FromRequestParts, RawPathParams, Request},
    response::Response,
};
use std::{
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    task::{Context, Poll},
};
use tower::{Layer, Service};
use tracing::{debug, info_span, instrument, Instrument};

pub mod body_wrapper;
use body_wrapper::{body_is_absent, create_body_capture};
pub use body_wrapper::{BodyCaptureError, CaptureOutcome};

mod bounded;
pub use bounded::BoundedCapture;

mod config;
pub use config::{ConfigError, RequestLoggerConfig};

mod context;
pub use context::{ContextFields, DiagnosticContext, FieldNames, LoggedField, MdcMap};

mod logger;
pub use logger::{
    Phase, RequestEnricher, RequestId, RequestLifecycle, RequestLogger, RequestLoggerBuilder,
    RequestView, ResponseView,
};

mod mapping;
pub use mapping::{apply_mappings, merge_mappings, parse_query, summarize_query, RequestParameters};

mod redaction;
pub use redaction::{BodyFilter, FieldMask, FilterError, FilterRegistry, PatternMask, RedactionChain};

mod resolver;
pub use resolver::{
    ContractDeclarations, Logged, OperationDeclarations, ResolvedEndpoint, ResourceDeclarations,
};

mod sink;
pub use sink::{LogRecord, LogSink, MemorySink, MultiSink, TracingSink};

pub mod types;
pub use types::{
    BodyDeclaration, BodyLogging, LogMode, LoggingConfiguration, ParamKind, ParameterMapping, Target,
};

/// Tower layer logging the requests of one route.
///
/// Attach one instance per route, with the endpoint resolved for that route:
///
/// ```rust
/// use axum::{routing::get, Router};
/// use logged_http::{LoggedLayer, RequestLogger, ResolvedEndpoint};
/// use std::sync::Arc;
///
/// # async fn list() -> &'static str { "[]" }
/// let logger = Arc::new(RequestLogger::new());
/// let app: Router = Router::new().route(
///     "/articles",
///     get(list).layer(LoggedLayer::new(logger, ResolvedEndpoint::new("ArticleResource", "list"))),
/// );
/// ```
#[derive(Clone, Debug)]
pub struct LoggedLayer {
    logger: Arc<RequestLogger>,
    endpoint: Arc<ResolvedEndpoint>,
}

impl LoggedLayer {
    pub fn new(logger: Arc<RequestLogger>, endpoint: ResolvedEndpoint) -> Self {
        Self {
            logger,
            endpoint: Arc::new(endpoint),
        }
    }

    /// Resolves `operation` on `resource`. An operation the resource does not
    /// declare is still logged, without body capture nor mappings.
    pub fn for_operation(
        logger: Arc<RequestLogger>,
        resource: &ResourceDeclarations,
        operation: &str,
    ) -> Self {
        let endpoint = resource
            .resolve(operation)
            .unwrap_or_else(|| ResolvedEndpoint::new(resource.name.clone(), operation));
        Self::new(logger, endpoint)
    }

    pub fn endpoint(&self) -> &ResolvedEndpoint {
        &self.endpoint
    }
}

impl<S> Layer<S> for LoggedLayer {
    type Service = LoggedService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        LoggedService {
            inner,
            logger: self.logger.clone(),
            endpoint: self.endpoint.clone(),
        }
    }
}

/// Tower service driving the request phases around the inner service.
///
/// The inner service runs inside a `request` span carrying the request id,
/// method, path and operation, and finds the id as a [`RequestId`] extension.
///
/// Users typically don't interact with this type directly - it's created by [`LoggedLayer`].
#[derive(Clone, Debug)]
pub struct LoggedService<S> {
    inner: S,
    logger: Arc<RequestLogger>,
    endpoint: Arc<ResolvedEndpoint>,
}

fn lock(lifecycle: &Mutex<RequestLifecycle>) -> MutexGuard<'_, RequestLifecycle> {
    lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<S> Service<Request> for LoggedService<S>
where
    S: Service<Request, Response = Response> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
{
    type Response = Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    #[instrument(skip_all)]
    fn call(&mut self, request: Request) -> Self::Future {
        let logger = self.logger.clone();
        let endpoint = self.endpoint.clone();
        // The ready service is the one to call, leave a fresh clone behind
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            let (mut parts, body) = request.into_parts();
            let path_params: Vec<(String, String)> = RawPathParams::from_request_parts(&mut parts, &())
                .await
                .map(|params| {
                    params
                        .iter()
                        .map(|(name, value)| (name.to_string(), value.to_string()))
                        .collect()
                })
                .unwrap_or_default();

            let (lifecycle, request_capture, correlation_id) = {
                let view = RequestView {
                    method: &parts.method,
                    uri: &parts.uri,
                    headers: &parts.headers,
                    path_params: &path_params,
                    has_body: !body_is_absent(&body),
                };
                let mut lifecycle = logger.on_request(&endpoint, &view);
                let capture = lifecycle.begin_request_body();
                let correlation_id = lifecycle.correlation_id().to_string();
                (Arc::new(Mutex::new(lifecycle)), capture, correlation_id)
            };

            let span = info_span!(
                "request",
                request_id = %correlation_id,
                method = %parts.method,
                uri = %parts.uri.path(),
                operation = %endpoint.operation(),
            );
            parts.extensions.insert(RequestId::new(correlation_id));

            let body = match request_capture {
                Some(capture) => {
                    let logger = logger.clone();
                    let lifecycle = lifecycle.clone();
                    create_body_capture(body, capture, move |outcome| {
                        logger.on_request_body(&mut lock(&lifecycle), outcome)
                    })
                }
                None => body,
            };

            let response = inner
                .call(Request::from_parts(parts, body))
                .instrument(span)
                .await?;

            let (parts, body) = response.into_parts();
            let response_capture = {
                let mut guard = lock(&lifecycle);
                let view = ResponseView {
                    status: parts.status,
                    has_body: !body_is_absent(&body),
                };
                logger.on_response(&mut guard, &view);
                guard.begin_response_body()
            };

            let body: Body = match response_capture {
                Some(capture) => create_body_capture(body, capture, move |outcome| {
                    logger.on_response_body(&mut lock(&lifecycle), outcome)
                }),
                None => {
                    debug!(status = %parts.status, "Response body not captured");
                    body
                }
            };

            Ok(Response::from_parts(parts, body))
        })
    }
}
