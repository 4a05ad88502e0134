//! Per-request orchestration.
//!
//! [`RequestLogger`] exposes four entry points, called in this order by the
//! host glue:
//!
//! 1. [`RequestLogger::on_request`] when the request head is available,
//! 2. [`RequestLogger::on_request_body`] once the request body was consumed,
//! 3. [`RequestLogger::on_response`] when the inner service answered,
//! 4. [`RequestLogger::on_response_body`] once the response body was written.
//!
//! Body phases only happen when the matching direction has logging modes and
//! a body. The state of one request lives in a [`RequestLifecycle`], whose
//! diagnostic fields are cleared on every exit path.

use crate::body_wrapper::CaptureOutcome;
use crate::bounded::BoundedCapture;
use crate::config::{ConfigError, RequestLoggerConfig};
use crate::context::{ContextFields, DiagnosticContext, FieldNames, LoggedField, MdcMap};
use crate::mapping::{apply_mappings, parse_query, summarize_query, RequestParameters};
use crate::redaction::FilterRegistry;
use crate::resolver::ResolvedEndpoint;
use crate::sink::{LogSink, TracingSink};
use crate::types::{BodyLogging, LoggingConfiguration};
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

/// The parts of an incoming request the logger looks at.
#[derive(Debug, Clone, Copy)]
pub struct RequestView<'a> {
    pub method: &'a Method,
    pub uri: &'a Uri,
    pub headers: &'a HeaderMap,
    /// Path parameters captured by the router
    pub path_params: &'a [(String, String)],
    pub has_body: bool,
}

/// The parts of a response the logger looks at.
#[derive(Debug, Clone, Copy)]
pub struct ResponseView {
    pub status: StatusCode,
    pub has_body: bool,
}

/// Correlation id of the request being served.
///
/// Inserted into the request extensions, so handlers can take it as an
/// `Extension<RequestId>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestId(String);

impl RequestId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Publishes additional fields when a request comes in.
///
/// Slots written through `fields` are cleared with the rest of the request.
/// Closures taking the same arguments are enrichers too.
pub trait RequestEnricher: Send + Sync + 'static {
    fn enrich(&self, request: &RequestView<'_>, fields: &mut ContextFields);
}

impl<F> RequestEnricher for F
where
    F: Fn(&RequestView<'_>, &mut ContextFields) + Send + Sync + 'static,
{
    fn enrich(&self, request: &RequestView<'_>, fields: &mut ContextFields) {
        self(request, fields)
    }
}

/// Where a request is in its processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Start,
    RequestHeadersLogged,
    RequestBodyPhase,
    ResponseHeadersLogged,
    ResponseBodyPhase,
    Done,
}

/// State of one in-flight request.
///
/// Dropping it before it is done still clears every field it published.
pub struct RequestLifecycle {
    correlation_id: String,
    started: Option<Instant>,
    configuration: Arc<LoggingConfiguration>,
    method: String,
    uri: String,
    status: Option<StatusCode>,
    duration_ms: u64,
    request_has_body: bool,
    response_has_body: bool,
    request_body: Option<String>,
    request_pending: bool,
    processed: Option<String>,
    phase: Phase,
    fields: ContextFields,
}

impl RequestLifecycle {
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn configuration(&self) -> &LoggingConfiguration {
        &self.configuration
    }

    /// Milliseconds between request entry and response entry.
    pub fn duration_ms(&self) -> u64 {
        self.duration_ms
    }

    pub fn fields(&self) -> &ContextFields {
        &self.fields
    }

    /// Starts the request body phase, returning the capture to feed with the
    /// body bytes. `None` when the request body must not be captured.
    pub fn begin_request_body(&mut self) -> Option<BoundedCapture<io::Sink>> {
        if self.phase != Phase::RequestHeadersLogged {
            return None;
        }
        let capture = capture_for(&self.configuration.request, self.request_has_body)?;
        self.phase = Phase::RequestBodyPhase;
        self.request_pending = true;
        Some(capture)
    }

    /// Starts the response body phase, see [`RequestLifecycle::begin_request_body`].
    pub fn begin_response_body(&mut self) -> Option<BoundedCapture<io::Sink>> {
        if self.phase != Phase::ResponseHeadersLogged {
            return None;
        }
        let capture = capture_for(&self.configuration.response, self.response_has_body)?;
        self.phase = Phase::ResponseBodyPhase;
        Some(capture)
    }
}

fn capture_for(logging: &BodyLogging, has_body: bool) -> Option<BoundedCapture<io::Sink>> {
    (logging.is_active() && has_body).then(|| BoundedCapture::detached(logging.capture_limit()))
}

impl Drop for RequestLifecycle {
    fn drop(&mut self) {
        if self.phase != Phase::Done {
            debug!(
                correlation_id = %self.correlation_id,
                phase = ?self.phase,
                "Request ended before being processed, clearing its fields"
            );
        }
    }
}

impl fmt::Debug for RequestLifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestLifecycle")
            .field("correlation_id", &self.correlation_id)
            .field("method", &self.method)
            .field("uri", &self.uri)
            .field("phase", &self.phase)
            .field("status", &self.status)
            .field("duration_ms", &self.duration_ms)
            .finish()
    }
}

/// Emits the "received" and "processed" lines of every request and manages
/// their diagnostic fields.
///
/// # Examples
///
/// ```rust
/// use axum::http::{HeaderMap, Method, StatusCode, Uri};
/// use logged_http::{MemorySink, RequestLogger, RequestView, ResolvedEndpoint, ResponseView};
///
/// let sink = MemorySink::new();
/// let logger = RequestLogger::builder().sink(sink.clone()).build();
/// let endpoint = ResolvedEndpoint::new("ArticleResource", "list");
///
/// let (method, uri, headers) = (Method::GET, Uri::from_static("/articles?page=2"), HeaderMap::new());
/// let request = RequestView { method: &method, uri: &uri, headers: &headers, path_params: &[], has_body: false };
///
/// let mut lifecycle = logger.on_request(&endpoint, &request);
/// logger.on_response(&mut lifecycle, &ResponseView { status: StatusCode::OK, has_body: true });
///
/// let records = sink.records();
/// assert!(records[0].line.starts_with("Processed GET /articles with status 200 in "));
/// assert_eq!(records[0].context["request-parameters"], "page=2");
/// ```
pub struct RequestLogger {
    request_id_header: String,
    names: Arc<FieldNames>,
    filters: FilterRegistry,
    sink: Arc<dyn LogSink>,
    context_store: Option<Arc<dyn DiagnosticContext>>,
    enrichers: Vec<Arc<dyn RequestEnricher>>,
}

impl Default for RequestLogger {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl RequestLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builder() -> RequestLoggerBuilder {
        RequestLoggerBuilder::default()
    }

    pub fn field_names(&self) -> &FieldNames {
        &self.names
    }

    pub fn filters(&self) -> &FilterRegistry {
        &self.filters
    }

    /// Request entry: publishes the request fields and applies the mappings.
    ///
    /// Logs the "received" line right away when the request body is to be
    /// logged but there is none.
    pub fn on_request(&self, endpoint: &ResolvedEndpoint, request: &RequestView<'_>) -> RequestLifecycle {
        let started = Instant::now();
        let store = self
            .context_store
            .clone()
            .unwrap_or_else(|| Arc::new(MdcMap::new()));
        let mut fields = ContextFields::new(store, self.names.clone());

        let correlation_id = self.request_id(request.headers);
        let method = request.method.as_str().to_string();
        let uri = request.uri.path().to_string();
        let query = parse_query(request.uri.query());

        fields.publish(LoggedField::RequestId, correlation_id.clone());
        fields.publish(LoggedField::RequestUri, uri.clone());
        fields.publish(LoggedField::RequestParameters, summarize_query(&query));
        fields.publish(LoggedField::RequestMethod, method.clone());
        if !endpoint.resource().is_empty() {
            fields.publish(LoggedField::Resource, endpoint.resource());
        }
        if !endpoint.operation().is_empty() {
            fields.publish(LoggedField::Operation, endpoint.operation());
        }

        let parameters = RequestParameters {
            query: &query,
            path: request.path_params,
            headers: request.headers,
        };
        apply_mappings(endpoint.mappings(), &parameters, &mut fields);
        for enricher in &self.enrichers {
            enricher.enrich(request, &mut fields);
        }

        debug!(correlation_id = %correlation_id, method = %method, uri = %uri, "Starting request processing");

        let lifecycle = RequestLifecycle {
            correlation_id,
            started: Some(started),
            configuration: endpoint.shared_configuration(),
            method,
            uri,
            status: None,
            duration_ms: 0,
            request_has_body: request.has_body,
            response_has_body: false,
            request_body: None,
            request_pending: false,
            processed: None,
            phase: Phase::RequestHeadersLogged,
            fields,
        };
        if lifecycle.configuration.request.logs() && !request.has_body {
            self.log_received(&lifecycle, "");
        }
        lifecycle
    }

    /// Request body phase: redacts the captured body, logs and stores it.
    ///
    /// The body may complete after the response entry when the handler
    /// streams it into its response. The "processed" line then waits for it.
    pub fn on_request_body(&self, lifecycle: &mut RequestLifecycle, outcome: CaptureOutcome) {
        if lifecycle.phase == Phase::Done {
            debug!(correlation_id = %lifecycle.correlation_id, "Request body completed after the request was processed");
            return;
        }
        lifecycle.request_pending = false;
        let configuration = lifecycle.configuration.clone();
        let body = self.render(&lifecycle.correlation_id, outcome, &configuration.request);

        if configuration.request.logs() && !body.trim().is_empty() {
            self.log_received(lifecycle, &body);
        }
        if configuration.request.publishes() {
            lifecycle.fields.publish(LoggedField::RequestBody, body.clone());
            lifecycle.request_body = Some(body);
        }
        if let Some(response_body) = lifecycle.processed.take() {
            self.finalize(lifecycle, &response_body);
        }
    }

    /// Response entry: publishes status and duration.
    ///
    /// Unless the response body phase follows, this also emits the
    /// "processed" line and clears the fields.
    pub fn on_response(&self, lifecycle: &mut RequestLifecycle, response: &ResponseView) {
        if matches!(lifecycle.phase, Phase::ResponseHeadersLogged | Phase::ResponseBodyPhase | Phase::Done) {
            return;
        }
        let duration_ms = lifecycle
            .started
            .map(|started| u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX))
            .unwrap_or(0);

        lifecycle.duration_ms = duration_ms;
        lifecycle.status = Some(response.status);
        lifecycle.response_has_body = response.has_body;
        lifecycle.fields.publish(LoggedField::Duration, duration_ms.to_string());
        lifecycle
            .fields
            .publish(LoggedField::ResponseStatus, response.status.as_u16().to_string());
        lifecycle.phase = Phase::ResponseHeadersLogged;

        if !(lifecycle.configuration.response.is_active() && response.has_body) {
            self.complete(lifecycle, String::new());
        }
    }

    /// Response body phase: redacts the captured body and emits the
    /// "processed" line.
    pub fn on_response_body(&self, lifecycle: &mut RequestLifecycle, outcome: CaptureOutcome) {
        if lifecycle.phase == Phase::Done || lifecycle.processed.is_some() {
            return;
        }
        let configuration = lifecycle.configuration.clone();
        let body = self.render(&lifecycle.correlation_id, outcome, &configuration.response);

        if configuration.response.publishes() {
            lifecycle.fields.publish(LoggedField::ResponseBody, body.clone());
        }
        let logged = if configuration.response.logs() { body } else { String::new() };
        self.complete(lifecycle, logged);
    }

    fn complete(&self, lifecycle: &mut RequestLifecycle, response_body: String) {
        if lifecycle.request_pending {
            debug!(correlation_id = %lifecycle.correlation_id, "Waiting for the request body before logging");
            lifecycle.processed = Some(response_body);
        } else {
            self.finalize(lifecycle, &response_body);
        }
    }

    fn finalize(&self, lifecycle: &mut RequestLifecycle, response_body: &str) {
        if lifecycle.configuration.request.publishes() {
            let stored = lifecycle.request_body.clone();
            lifecycle.fields.publish_opt(LoggedField::RequestBody, stored);
        }

        let status = lifecycle
            .status
            .map(|status| status.as_u16().to_string())
            .unwrap_or_default();
        let line = format!(
            "Processed {} {} with status {} in {}ms{}",
            lifecycle.method,
            lifecycle.uri,
            status,
            lifecycle.duration_ms,
            body_suffix(response_body)
        );
        self.sink.info(&line, &lifecycle.fields.snapshot());

        lifecycle.fields.clear();
        lifecycle.phase = Phase::Done;
        debug!(correlation_id = %lifecycle.correlation_id, "Request processing completed");
    }

    fn log_received(&self, lifecycle: &RequestLifecycle, request_body: &str) {
        let line = format!(
            "Received {} {}{}",
            lifecycle.method,
            lifecycle.uri,
            body_suffix(request_body)
        );
        self.sink.info(&line, &lifecycle.fields.snapshot());
    }

    fn render(&self, correlation_id: &str, outcome: CaptureOutcome, logging: &BodyLogging) -> String {
        match outcome {
            Ok(bytes) => self
                .filters
                .chain(&logging.filters)
                .apply(String::from_utf8_lossy(&bytes).into_owned()),
            Err(e) => {
                warn!(correlation_id = %correlation_id, error = %e, "Body capture failed");
                format!("<body capture failed: {e}>")
            }
        }
    }

    /// The caller's request id, or a fresh UUID.
    fn request_id(&self, headers: &HeaderMap) -> String {
        headers
            .get(self.request_id_header.as_str())
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string())
    }
}

fn body_suffix(body: &str) -> String {
    if body.trim().is_empty() {
        String::new()
    } else {
        format!("\n{body}")
    }
}

impl fmt::Debug for RequestLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestLogger")
            .field("request_id_header", &self.request_id_header)
            .field("names", &self.names)
            .field("filters", &self.filters)
            .field("shared_context", &self.context_store.is_some())
            .field("enrichers", &self.enrichers.len())
            .finish()
    }
}

/// Builder for [`RequestLogger`].
pub struct RequestLoggerBuilder {
    request_id_header: String,
    names: FieldNames,
    filters: FilterRegistry,
    sink: Arc<dyn LogSink>,
    context_store: Option<Arc<dyn DiagnosticContext>>,
    enrichers: Vec<Arc<dyn RequestEnricher>>,
}

impl Default for RequestLoggerBuilder {
    fn default() -> Self {
        let config = RequestLoggerConfig::default();
        Self {
            request_id_header: config.request_id_header,
            names: FieldNames::default(),
            filters: FilterRegistry::new(),
            sink: Arc::new(TracingSink),
            context_store: None,
            enrichers: Vec::new(),
        }
    }
}

impl RequestLoggerBuilder {
    /// Starts from loaded settings.
    pub fn from_config(config: &RequestLoggerConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            names: config.field_names()?,
            ..Self::default()
        }
        .request_id_header(config.request_id_header.as_str()))
    }

    /// Header read for the caller's request id.
    pub fn request_id_header(mut self, header: impl Into<String>) -> Self {
        self.request_id_header = header.into().to_ascii_lowercase();
        self
    }

    pub fn rename(mut self, field: LoggedField, slot: impl Into<String>) -> Self {
        self.names = self.names.rename(field, slot);
        self
    }

    /// Declares a slot written by an enricher.
    pub fn extra_field(mut self, slot: impl Into<String>) -> Self {
        self.names = self.names.with_extra(slot);
        self
    }

    pub fn filters(mut self, filters: FilterRegistry) -> Self {
        self.filters = filters;
        self
    }

    pub fn sink(mut self, sink: impl LogSink) -> Self {
        self.sink = Arc::new(sink);
        self
    }

    /// Shares one store between all requests instead of a fresh one each.
    pub fn context_store(mut self, store: impl DiagnosticContext) -> Self {
        self.context_store = Some(Arc::new(store));
        self
    }

    pub fn enricher(mut self, enricher: impl RequestEnricher) -> Self {
        self.enrichers.push(Arc::new(enricher));
        self
    }

    pub fn build(self) -> RequestLogger {
        RequestLogger {
            request_id_header: self.request_id_header,
            names: Arc::new(self.names),
            filters: self.filters,
            sink: self.sink,
            context_store: self.context_store,
            enrichers: self.enrichers,
        }
    }
}
