//! Call interceptors.
//!
//! An [`Interceptor`] wraps a call: it receives the [`Call`] plus the rest of
//! the chain as a [`Next`] continuation, and may either return early or
//! delegate and post-process the outcome. [`InterceptorChain`] nests them in
//! list order, outermost first, around the session handler.
//!
//! The stock chain is `[LoggingInterceptor, AuthInterceptor]`: logging sees
//! every outcome including authentication failures, and authentication runs
//! before any session side effect.
//!
//! Streaming handlers return before their transfer ends. Their output carries
//! a [`Completion`] that resolves to the terminal outcome, and logging records
//! the call only once that has resolved.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use futures::future::{BoxFuture, Shared};
use futures::{FutureExt, Stream};
use tonic::metadata::MetadataMap;
use tonic::{Code, Response, Status};

use crate::channel::ResponseStream;

/// Metadata key carrying the bearer credential.
pub const AUTHORIZATION_HEADER: &str = "authorization";

const BEARER_PREFIX: &str = "Bearer ";

/// The RPC a call targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// Unary file listing
    ListFiles,
    /// Server-streaming download
    Download,
    /// Client-streaming upload
    Upload,
    /// Bidirectional upload with progress notices
    UploadAndNotifyProgress,
}

/// Stream shape of an RPC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallShape {
    /// One request, one response
    Unary,
    /// One request, a stream of responses
    ServerStreaming,
    /// A stream of requests, one response
    ClientStreaming,
    /// Independent request and response streams
    Bidirectional,
}

impl Method {
    /// Fully qualified gRPC path.
    pub fn path(self) -> &'static str {
        match self {
            Method::ListFiles => "/ferry.v1.FileService/ListFiles",
            Method::Download => "/ferry.v1.FileService/Download",
            Method::Upload => "/ferry.v1.FileService/Upload",
            Method::UploadAndNotifyProgress => "/ferry.v1.FileService/UploadAndNotifyProgress",
        }
    }

    /// Stream shape of this RPC.
    pub fn shape(self) -> CallShape {
        match self {
            Method::ListFiles => CallShape::Unary,
            Method::Download => CallShape::ServerStreaming,
            Method::Upload => CallShape::ClientStreaming,
            Method::UploadAndNotifyProgress => CallShape::Bidirectional,
        }
    }
}

/// What an interceptor sees of an inbound call.
#[derive(Debug)]
pub struct Call {
    method: Method,
    metadata: MetadataMap,
    request: String,
}

impl Call {
    /// Describe a call from its metadata and a rendering of its request.
    pub fn new(method: Method, metadata: MetadataMap, request: impl Into<String>) -> Self {
        Self {
            method,
            metadata,
            request: request.into(),
        }
    }

    /// The targeted RPC.
    pub fn method(&self) -> Method {
        self.method
    }

    /// Call metadata, including any credential.
    pub fn metadata(&self) -> &MetadataMap {
        &self.metadata
    }

    /// Human-readable rendering of the request.
    pub fn request(&self) -> &str {
        &self.request
    }
}

/// Resolves to how a streaming call ended, after its last message.
pub type Completion = Shared<BoxFuture<'static, CallOutcome>>;

/// Rendering of a handler's output for call logs.
pub trait Describe {
    /// One-line description.
    fn describe(&self) -> String;

    /// Terminal outcome of a call that keeps running after the handler
    /// returns. `None` when the handler's result is final.
    fn completion(&self) -> Option<Completion> {
        None
    }
}

impl<T: Describe> Describe for Response<T> {
    fn describe(&self) -> String {
        self.get_ref().describe()
    }

    fn completion(&self) -> Option<Completion> {
        self.get_ref().completion()
    }
}

/// A response stream together with the outcome of the transfer feeding it.
pub struct StreamReply<T> {
    stream: ResponseStream<T>,
    completion: Completion,
}

impl<T> fmt::Debug for StreamReply<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamReply").finish_non_exhaustive()
    }
}

impl<T> StreamReply<T> {
    /// Pair `stream` with `done`, which resolves once the stream has ended.
    pub fn new<S, D>(stream: S, done: D) -> Self
    where
        S: Stream<Item = Result<T, Status>> + Send + 'static,
        D: Future<Output = CallOutcome> + Send + 'static,
    {
        Self {
            stream: Box::pin(stream),
            completion: done.boxed().shared(),
        }
    }

    /// The stream to hand to tonic.
    pub fn into_stream(self) -> ResponseStream<T> {
        self.stream
    }
}

impl<T> Describe for StreamReply<T> {
    fn describe(&self) -> String {
        "<stream>".to_string()
    }

    fn completion(&self) -> Option<Completion> {
        Some(self.completion.clone())
    }
}

/// Type-erased handler output travelling back up the chain.
pub struct CallResponse {
    summary: String,
    completion: Option<Completion>,
    value: Box<dyn Any + Send>,
}

impl fmt::Debug for CallResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallResponse")
            .field("summary", &self.summary)
            .field("streaming", &self.completion.is_some())
            .finish_non_exhaustive()
    }
}

impl CallResponse {
    /// Wrap a handler's output.
    pub fn new<T: Describe + Send + 'static>(value: T) -> Self {
        Self {
            summary: value.describe(),
            completion: value.completion(),
            value: Box::new(value),
        }
    }

    /// Rendering of the wrapped output.
    pub fn summary(&self) -> &str {
        &self.summary
    }

    /// Terminal outcome, for output that is still streaming.
    pub fn completion(&self) -> Option<Completion> {
        self.completion.clone()
    }

    fn downcast<T: 'static>(self) -> Result<T, Status> {
        self.value
            .downcast::<T>()
            .map(|b| *b)
            .map_err(|_| Status::internal("interceptor replaced the response with another type"))
    }
}

/// The remainder of the chain, ending in the session handler.
pub type Next<'a> =
    Box<dyn FnOnce(Call) -> BoxFuture<'a, Result<CallResponse, Status>> + Send + 'a>;

/// A handler wrapping every call.
pub trait Interceptor: Send + Sync + fmt::Debug {
    /// Handle `call`, delegating to `next` to run the rest of the chain.
    fn intercept<'a>(
        &'a self,
        call: Call,
        next: Next<'a>,
    ) -> BoxFuture<'a, Result<CallResponse, Status>>;
}

/// Ordered interceptors, outermost first.
#[derive(Debug, Clone, Default)]
pub struct InterceptorChain {
    interceptors: Vec<Arc<dyn Interceptor>>,
}

impl InterceptorChain {
    /// An empty chain: calls go straight to their handler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Logging around authentication against `token`.
    pub fn standard(token: impl Into<String>) -> Self {
        Self::new()
            .with(LoggingInterceptor::new())
            .with(AuthInterceptor::new(token))
    }

    /// Append an interceptor inside the ones already present.
    pub fn with(mut self, interceptor: impl Interceptor + 'static) -> Self {
        self.interceptors.push(Arc::new(interceptor));
        self
    }

    /// Number of interceptors.
    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    /// Whether the chain has no interceptors.
    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    /// Run `handler` for `call` inside every interceptor.
    pub async fn run<T, F, Fut>(&self, call: Call, handler: F) -> Result<T, Status>
    where
        T: Describe + Send + 'static,
        F: FnOnce(Call) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, Status>> + Send + 'static,
    {
        let handler: Next<'_> =
            Box::new(move |call| async move { handler(call).await.map(CallResponse::new) }.boxed());
        dispatch(&self.interceptors, call, handler).await?.downcast()
    }
}

fn dispatch<'a>(
    interceptors: &'a [Arc<dyn Interceptor>],
    call: Call,
    handler: Next<'a>,
) -> BoxFuture<'a, Result<CallResponse, Status>> {
    match interceptors.split_first() {
        Some((outer, rest)) => {
            outer.intercept(call, Box::new(move |call| dispatch(rest, call, handler)))
        }
        None => handler(call),
    }
}

/// How a logged call ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallOutcome {
    /// Handler output summary
    Ok(String),
    /// Failure status
    Err {
        /// Status code
        code: Code,
        /// Status message
        message: String,
    },
}

impl CallOutcome {
    /// Outcome of a call that ended with `status`.
    pub fn failed(status: &Status) -> Self {
        CallOutcome::Err {
            code: status.code(),
            message: status.message().to_string(),
        }
    }
}

/// Snapshot of one call's input and output.
#[derive(Debug, Clone)]
pub struct CallRecord {
    /// The targeted RPC
    pub method: Method,
    /// Rendering of the request
    pub request: String,
    /// How the call ended
    pub outcome: CallOutcome,
    /// Time from the call starting until its outcome was known
    pub elapsed: Duration,
}

impl CallRecord {
    fn log(&self) {
        let elapsed_ms = self.elapsed.as_millis() as u64;
        match &self.outcome {
            CallOutcome::Ok(summary) => tracing::info!(
                method = self.method.path(),
                outcome = %summary,
                elapsed_ms,
                "call finished"
            ),
            CallOutcome::Err { code, message } => tracing::warn!(
                method = self.method.path(),
                code = ?code,
                message = %message,
                elapsed_ms,
                "call failed"
            ),
        }
    }
}

type RecordObserver = Arc<dyn Fn(&CallRecord) + Send + Sync>;

/// Logs each call's request and outcome.
///
/// Failures are logged and handed back unchanged. A streaming response is
/// recorded when its [`Completion`] resolves rather than when the handler
/// returns, so the record carries the status the client actually saw.
#[derive(Clone, Default)]
pub struct LoggingInterceptor {
    observer: Option<RecordObserver>,
}

impl fmt::Debug for LoggingInterceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoggingInterceptor")
            .field("observer", &self.observer.is_some())
            .finish()
    }
}

impl LoggingInterceptor {
    /// Log to `tracing` only.
    pub fn new() -> Self {
        Self::default()
    }

    /// Also hand every finished [`CallRecord`] to `observer`.
    pub fn with_observer(observer: impl Fn(&CallRecord) + Send + Sync + 'static) -> Self {
        Self {
            observer: Some(Arc::new(observer)),
        }
    }
}

impl Interceptor for LoggingInterceptor {
    fn intercept<'a>(
        &'a self,
        call: Call,
        next: Next<'a>,
    ) -> BoxFuture<'a, Result<CallResponse, Status>> {
        async move {
            let method = call.method();
            let request = call.request().to_string();
            tracing::info!(
                method = method.path(),
                shape = ?method.shape(),
                request = %request,
                "call started"
            );

            let started = Instant::now();
            let result = next(call).await;

            if let Some(done) = result.as_ref().ok().and_then(CallResponse::completion) {
                tracing::debug!(method = method.path(), "call streaming");
                let observer = self.observer.clone();
                tokio::spawn(async move {
                    let outcome = done.await;
                    record(observer.as_ref(), method, request, outcome, started);
                });
                return result;
            }

            let outcome = match &result {
                Ok(response) => CallOutcome::Ok(response.summary().to_string()),
                Err(status) => CallOutcome::failed(status),
            };

            record(self.observer.as_ref(), method, request, outcome, started);
            result
        }
        .boxed()
    }
}

fn record(
    observer: Option<&RecordObserver>,
    method: Method,
    request: String,
    outcome: CallOutcome,
    started: Instant,
) {
    let record = CallRecord {
        method,
        request,
        outcome,
        elapsed: started.elapsed(),
    };
    record.log();
    if let Some(observer) = observer {
        observer(&record);
    }
}

/// Counts calls that have started and whose outcome is not yet known.
///
/// A streaming call stays counted until its [`Completion`] resolves.
#[derive(Debug, Clone, Default)]
pub struct ActiveCalls {
    count: Arc<AtomicUsize>,
}

struct ActiveGuard(Arc<AtomicUsize>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ActiveCalls {
    /// A tracker with nothing in flight.
    pub fn new() -> Self {
        Self::default()
    }

    /// Calls currently in flight.
    pub fn current(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    fn enter(&self) -> ActiveGuard {
        self.count.fetch_add(1, Ordering::SeqCst);
        ActiveGuard(self.count.clone())
    }
}

impl Interceptor for ActiveCalls {
    fn intercept<'a>(
        &'a self,
        call: Call,
        next: Next<'a>,
    ) -> BoxFuture<'a, Result<CallResponse, Status>> {
        async move {
            let guard = self.enter();
            let result = next(call).await;
            if let Some(done) = result.as_ref().ok().and_then(CallResponse::completion) {
                tokio::spawn(async move {
                    done.await;
                    drop(guard);
                });
            }
            result
        }
        .boxed()
    }
}

/// Credential presented with a call.
pub struct AuthContext {
    token: String,
}

impl fmt::Debug for AuthContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthContext")
            .field("token", &"<redacted>")
            .finish()
    }
}

impl AuthContext {
    /// Extract the bearer credential from call metadata.
    pub fn from_metadata(metadata: &MetadataMap) -> Result<Self, Status> {
        let header = metadata
            .get(AUTHORIZATION_HEADER)
            .ok_or_else(|| Status::unauthenticated("missing authorization header"))?
            .to_str()
            .map_err(|_| Status::unauthenticated("malformed authorization header"))?;

        let token = header
            .strip_prefix(BEARER_PREFIX)
            .ok_or_else(|| Status::unauthenticated("invalid authorization scheme"))?
            .trim();
        if token.is_empty() {
            return Err(Status::unauthenticated("empty bearer token"));
        }
        Ok(Self {
            token: token.to_string(),
        })
    }

    /// The presented token.
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Compare against the expected token without short-circuiting on the
    /// first differing byte.
    pub fn matches(&self, expected: &str) -> bool {
        if self.token.len() != expected.len() {
            return false;
        }
        let mut diff = 0u8;
        for (a, b) in self.token.bytes().zip(expected.bytes()) {
            diff |= a ^ b;
        }
        diff == 0
    }
}

/// Rejects calls that do not carry `authorization: Bearer <token>`.
#[derive(Clone)]
pub struct AuthInterceptor {
    token: String,
}

impl fmt::Debug for AuthInterceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthInterceptor").finish_non_exhaustive()
    }
}

impl AuthInterceptor {
    /// Accept only calls presenting `token`.
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl Interceptor for AuthInterceptor {
    fn intercept<'a>(
        &'a self,
        call: Call,
        next: Next<'a>,
    ) -> BoxFuture<'a, Result<CallResponse, Status>> {
        async move {
            let auth = AuthContext::from_metadata(call.metadata())?;
            if !auth.matches(&self.token) {
                return Err(Status::unauthenticated("invalid token"));
            }
            tracing::debug!(method = call.method().path(), "call authenticated");
            next(call).await
        }
        .boxed()
    }
}
