//! Call translator: one gRPC call in, one FastCGI request out
//!
//! A call moves through [`CallPhase`]s strictly forward:
//!
//! ```text
//! Start -> AwaitingInboundFrame -> BackendCallInFlight -> Succeeded | Failed -> Done
//! ```
//!
//! Every suspension point (receiving the request, acquiring a connection, the
//! backend round trip, sending the reply) races the call's cancellation, and
//! the pooled connection is released on every exit path.

use async_trait::async_trait;
use http::StatusCode;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tonic::Status;
use tonic::metadata::MetadataMap;
use tracing::{Span, instrument};

use crate::backend::{BackendRequest, BackendResponse, Connector};
use crate::codec::Frame;
use crate::error::CallError;
use crate::metadata::{Metadata, remap_request_headers, response_metadata};
use crate::metrics;
use crate::pool::BackendPool;

/// Inbound side of a call, as seen by the translator
#[async_trait]
pub trait CallStream: Send {
    /// Next request message, `None` once the client half-closed
    async fn recv_frame(&mut self) -> Result<Option<Frame>, Status>;

    /// Send response metadata; must precede the response message
    async fn send_metadata(&mut self, metadata: MetadataMap) -> Result<(), Status>;

    async fn send_frame(&mut self, frame: Frame) -> Result<(), Status>;
}

/// Per-call state, owned by the task serving the call
#[derive(Debug)]
pub struct CallContext {
    pub method: String,
    pub metadata: Metadata,
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl CallContext {
    pub fn new(method: impl Into<String>, metadata: Metadata) -> Self {
        Self {
            method: method.into(),
            metadata,
            cancel: CancellationToken::new(),
            deadline: None,
        }
    }

    /// Tie the call to an existing token (cancelled on peer disconnect)
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Resolves when the call is cancelled or its deadline passes
    pub async fn cancelled(&self) -> CallError {
        match self.deadline {
            Some(deadline) => tokio::select! {
                _ = self.cancel.cancelled() => CallError::Cancelled,
                _ = tokio::time::sleep_until(deadline) => CallError::DeadlineExceeded,
            },
            None => {
                self.cancel.cancelled().await;
                CallError::Cancelled
            }
        }
    }

    /// Run `fut` unless the call is cancelled first
    pub async fn guard<T>(
        &self,
        fut: impl Future<Output = Result<T, CallError>>,
    ) -> Result<T, CallError> {
        tokio::select! {
            biased;
            err = self.cancelled() => Err(err),
            result = fut => result,
        }
    }
}

/// Where a call is in its lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CallPhase {
    Start,
    AwaitingInboundFrame,
    BackendCallInFlight,
    Succeeded,
    Failed,
    Done,
}

impl CallPhase {
    /// Move forward; a call never re-enters an earlier phase
    pub fn advance(&mut self, next: CallPhase) {
        let allowed = match (*self, next) {
            (CallPhase::Succeeded, CallPhase::Failed) => false,
            (current, next) => next > current,
        };
        debug_assert!(allowed, "invalid call transition {} -> {}", self, next);
        if allowed {
            *self = next;
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, CallPhase::Succeeded | CallPhase::Failed | CallPhase::Done)
    }
}

impl fmt::Display for CallPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CallPhase::Start => "start",
            CallPhase::AwaitingInboundFrame => "awaiting_inbound_frame",
            CallPhase::BackendCallInFlight => "backend_call_in_flight",
            CallPhase::Succeeded => "succeeded",
            CallPhase::Failed => "failed",
            CallPhase::Done => "done",
        };
        f.write_str(name)
    }
}

/// Turns gRPC calls into backend requests
pub struct CallTranslator<C: Connector> {
    pool: BackendPool<C>,
    entry_file: Arc<str>,
    default_host: Arc<str>,
}

impl<C: Connector> Clone for CallTranslator<C> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            entry_file: self.entry_file.clone(),
            default_host: self.default_host.clone(),
        }
    }
}

impl<C: Connector> CallTranslator<C> {
    pub fn new(
        pool: BackendPool<C>,
        entry_file: impl Into<Arc<str>>,
        default_host: impl Into<Arc<str>>,
    ) -> Self {
        Self {
            pool,
            entry_file: entry_file.into(),
            default_host: default_host.into(),
        }
    }

    pub fn pool(&self) -> &BackendPool<C> {
        &self.pool
    }

    pub fn entry_file(&self) -> &str {
        &self.entry_file
    }

    /// Serve one call to completion
    #[instrument(skip_all, fields(method = %ctx.method, host, phase))]
    pub async fn handle<S>(&self, ctx: CallContext, stream: &mut S) -> Result<(), CallError>
    where
        S: CallStream + ?Sized,
    {
        let started = std::time::Instant::now();
        let (reached, result) = self.execute(&ctx, stream).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        Span::current().record("phase", tracing::field::display(reached));

        match &result {
            Ok(()) => {
                metrics::record_call("ok");
                tracing::info!(elapsed_ms, "Call completed");
            }
            Err(e) => {
                metrics::record_call(e.kind());
                tracing::warn!(
                    error = %e,
                    kind = e.kind(),
                    failed_in = %reached,
                    elapsed_ms,
                    "Call failed"
                );
            }
        }

        result
    }

    /// Run the call through its phases
    ///
    /// Returns the last phase reached before the outcome was known, so a
    /// failure can be attributed to the step that produced it.
    async fn execute<S>(
        &self,
        ctx: &CallContext,
        stream: &mut S,
    ) -> (CallPhase, Result<(), CallError>)
    where
        S: CallStream + ?Sized,
    {
        let mut phase = CallPhase::Start;
        let result = self.run(ctx, stream, &mut phase).await;
        let reached = phase;

        phase.advance(if result.is_ok() {
            CallPhase::Succeeded
        } else {
            CallPhase::Failed
        });
        phase.advance(CallPhase::Done);

        (reached, result)
    }

    async fn run<S>(
        &self,
        ctx: &CallContext,
        stream: &mut S,
        phase: &mut CallPhase,
    ) -> Result<(), CallError>
    where
        S: CallStream + ?Sized,
    {
        phase.advance(CallPhase::AwaitingInboundFrame);
        let frame = ctx.guard(receive_single_frame(stream)).await?;

        let (host, headers) = remap_request_headers(&ctx.metadata, &self.default_host);
        Span::current().record("host", host.as_str());

        let request = BackendRequest::post(
            ctx.method.clone(),
            host,
            headers,
            frame.into_payload(),
            self.entry_file.clone(),
        );

        phase.advance(CallPhase::BackendCallInFlight);
        let response = self.call_backend(ctx, &request).await?;

        if response.status != StatusCode::OK {
            tracing::debug!(status = response.status.as_u16(), "Backend returned an error status");
            return Err(CallError::BackendStatus {
                status: response.status.as_u16(),
                body: response.body_text(),
            });
        }

        let metadata = response_metadata(&response.headers);
        ctx.guard(async {
            stream
                .send_metadata(metadata)
                .await
                .map_err(|s| CallError::Send(format!("failed to send headers: {}", s.message())))
        })
        .await?;

        let reply = Frame::new(response.body);
        ctx.guard(async {
            stream
                .send_frame(reply)
                .await
                .map_err(|s| CallError::Send(format!("failed to send message: {}", s.message())))
        })
        .await
    }

    /// Borrow a connection, run the request and give the connection back
    async fn call_backend(
        &self,
        ctx: &CallContext,
        request: &BackendRequest,
    ) -> Result<BackendResponse, CallError> {
        let mut conn = ctx
            .guard(async { self.pool.acquire().await.map_err(CallError::from) })
            .await?;

        let started = std::time::Instant::now();
        let outcome = tokio::select! {
            biased;
            err = ctx.cancelled() => Err(err),
            result = conn.round_trip(request) => result.map_err(CallError::from),
        };
        metrics::record_backend_duration(started.elapsed());

        if matches!(outcome, Err(CallError::Cancelled | CallError::DeadlineExceeded)) {
            // The backend may still be writing the abandoned response
            conn.mark_broken();
        }
        tracing::debug!(
            connection_id = conn.id(),
            broken = conn.is_broken(),
            "Releasing backend connection"
        );
        conn.release();

        outcome
    }
}

/// Exactly one request message, then end of stream
async fn receive_single_frame<S>(stream: &mut S) -> Result<Frame, CallError>
where
    S: CallStream + ?Sized,
{
    let first = stream
        .recv_frame()
        .await
        .map_err(|s| CallError::ProtocolViolation(format!("RecvMsg failed: {}", s.message())))?
        .ok_or_else(|| CallError::ProtocolViolation("no request message received".to_string()))?;

    match stream.recv_frame().await {
        Ok(None) => Ok(first),
        Ok(Some(_)) => Err(CallError::ProtocolViolation(
            "more than one request message received".to_string(),
        )),
        Err(s) => Err(CallError::ProtocolViolation(format!(
            "RecvMsg failed: {}",
            s.message()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendConnection;
    use crate::error::BackendError;
    use crate::pool::PoolConfig;
    use bytes::Bytes;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tonic::Code;

    /// Records what the translator sends, feeds it scripted requests
    #[derive(Default)]
    struct RecordingStream {
        inbound: VecDeque<Frame>,
        events: Vec<&'static str>,
        sent_frames: Vec<Bytes>,
        sent_metadata: Vec<MetadataMap>,
        fail_send_frame: bool,
    }

    impl RecordingStream {
        fn with_frames(frames: &[&'static [u8]]) -> Self {
            Self {
                inbound: frames.iter().map(|f| Frame::new(Bytes::from_static(f))).collect(),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl CallStream for RecordingStream {
        async fn recv_frame(&mut self) -> Result<Option<Frame>, Status> {
            Ok(self.inbound.pop_front())
        }

        async fn send_metadata(&mut self, metadata: MetadataMap) -> Result<(), Status> {
            self.events.push("metadata");
            self.sent_metadata.push(metadata);
            Ok(())
        }

        async fn send_frame(&mut self, frame: Frame) -> Result<(), Status> {
            if self.fail_send_frame {
                return Err(Status::unavailable("peer went away"));
            }
            self.events.push("frame");
            self.sent_frames.push(frame.payload);
            Ok(())
        }
    }

    type Reply = Result<BackendResponse, BackendError>;

    /// Backend double that answers with a fixed reply after a delay
    #[derive(Clone)]
    struct ScriptedConnector {
        reply: Arc<dyn Fn() -> Reply + Send + Sync>,
        delay: Duration,
        seen: Arc<Mutex<Vec<BackendRequest>>>,
    }

    impl ScriptedConnector {
        fn new(reply: impl Fn() -> Reply + Send + Sync + 'static) -> Self {
            Self {
                reply: Arc::new(reply),
                delay: Duration::ZERO,
                seen: Arc::default(),
            }
        }

        fn ok(body: &'static str) -> Self {
            Self::new(move || {
                let mut resp = BackendResponse::new(StatusCode::OK, body);
                resp.headers.insert("x-powered-by", "php".parse().unwrap());
                Ok(resp)
            })
        }

        fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }
    }

    struct ScriptedConnection(ScriptedConnector);

    #[async_trait]
    impl BackendConnection for ScriptedConnection {
        async fn round_trip(&mut self, request: &BackendRequest) -> Reply {
            self.0.seen.lock().unwrap().push(request.clone());
            tokio::time::sleep(self.0.delay).await;
            (self.0.reply)()
        }
    }

    #[async_trait]
    impl Connector for ScriptedConnector {
        type Connection = ScriptedConnection;

        async fn connect(&self) -> Result<ScriptedConnection, BackendError> {
            Ok(ScriptedConnection(self.clone()))
        }

        fn endpoint(&self) -> String {
            "scripted".to_string()
        }
    }

    fn translator(connector: ScriptedConnector, capacity: usize) -> CallTranslator<ScriptedConnector> {
        let pool = BackendPool::new(
            connector,
            PoolConfig {
                max_connections: capacity,
                acquire_timeout: Duration::from_millis(50),
                idle_timeout: None,
            },
        );
        CallTranslator::new(pool, "/srv/index.php", "localhost")
    }

    fn context() -> CallContext {
        let mut md = Metadata::new();
        md.append(":authority", "host.example");
        md.append("X-Trace", "a");
        md.append("X-Trace", "b");
        CallContext::new("/pkg.Greeter/SayHello", md)
    }

    #[tokio::test]
    async fn test_success_sends_metadata_then_frame() {
        let t = translator(ScriptedConnector::ok("OK"), 2);
        let mut stream = RecordingStream::with_frames(&[b"request"]);

        t.handle(context(), &mut stream).await.unwrap();

        assert_eq!(stream.events, ["metadata", "frame"]);
        assert_eq!(stream.sent_frames, [Bytes::from_static(b"OK")]);
        assert_eq!(stream.sent_metadata[0].get("x-powered-by").unwrap(), "php");
        assert_eq!(t.pool().stats().in_use, 0);
    }

    #[tokio::test]
    async fn test_backend_request_shape() {
        let connector = ScriptedConnector::ok("OK");
        let seen = connector.seen.clone();
        let t = translator(connector, 1);
        let mut stream = RecordingStream::with_frames(&[b"\x0a\x03abc"]);

        t.handle(context(), &mut stream).await.unwrap();

        let requests = seen.lock().unwrap();
        let req = &requests[0];
        assert_eq!(req.method, http::Method::POST);
        assert_eq!(req.path, "/pkg.Greeter/SayHello");
        assert_eq!(req.version, http::Version::HTTP_11);
        assert_eq!(req.host, "host.example");
        assert_eq!(&req.body[..], b"\x0a\x03abc");
        assert_eq!(&*req.entry_file, "/srv/index.php");
        let traces: Vec<_> = req.headers.get_all("x-trace").iter().collect();
        assert_eq!(traces, ["a", "b"]);
        assert!(req.headers.get(":authority").is_none());
    }

    #[tokio::test]
    async fn test_backend_error_status() {
        let t = translator(
            ScriptedConnector::new(|| {
                Ok(BackendResponse::new(StatusCode::INTERNAL_SERVER_ERROR, "boom"))
            }),
            1,
        );
        let mut stream = RecordingStream::with_frames(&[b"request"]);

        let err = t.handle(context(), &mut stream).await.unwrap_err();
        let status = Status::from(err);

        assert_eq!(status.code(), Code::Internal);
        assert!(status.message().contains("boom"));
        assert!(stream.events.is_empty());
        assert_eq!(t.pool().stats().in_use, 0);
    }

    #[tokio::test]
    async fn test_zero_messages_is_protocol_violation() {
        let t = translator(ScriptedConnector::ok("OK"), 1);
        let mut stream = RecordingStream::with_frames(&[]);

        let err = t.handle(context(), &mut stream).await.unwrap_err();

        assert!(matches!(err, CallError::ProtocolViolation(_)));
        assert_eq!(t.pool().stats().created, 0);
    }

    #[tokio::test]
    async fn test_two_messages_is_protocol_violation() {
        let t = translator(ScriptedConnector::ok("OK"), 1);
        let mut stream = RecordingStream::with_frames(&[b"one", b"two"]);

        let err = t.handle(context(), &mut stream).await.unwrap_err();

        assert!(matches!(err, CallError::ProtocolViolation(_)));
        assert!(stream.events.is_empty());
    }

    #[tokio::test]
    async fn test_send_failure_releases_connection() {
        let t = translator(ScriptedConnector::ok("OK"), 1);
        let mut stream = RecordingStream::with_frames(&[b"request"]);
        stream.fail_send_frame = true;

        let err = t.handle(context(), &mut stream).await.unwrap_err();

        assert!(matches!(err, CallError::Send(_)));
        let stats = t.pool().stats();
        assert_eq!(stats.in_use, 0);
        // The backend exchange itself was clean, so the connection is kept
        assert_eq!(stats.idle, 1);
    }

    #[tokio::test]
    async fn test_cancellation_mid_flight() {
        let t = translator(
            ScriptedConnector::ok("late").with_delay(Duration::from_secs(5)),
            1,
        );
        let mut stream = RecordingStream::with_frames(&[b"request"]);
        let ctx = context();
        let token = ctx.cancellation_token().clone();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            token.cancel();
        });
        let err = t.handle(ctx, &mut stream).await.unwrap_err();

        assert!(matches!(err, CallError::Cancelled));
        let stats = t.pool().stats();
        assert_eq!(stats.in_use, 0);
        assert_eq!(stats.idle, 0);
        assert_eq!(stats.discarded, 1);
    }

    #[tokio::test]
    async fn test_deadline_exceeded() {
        let t = translator(
            ScriptedConnector::ok("late").with_delay(Duration::from_secs(5)),
            1,
        );
        let mut stream = RecordingStream::with_frames(&[b"request"]);
        let ctx = context().with_timeout(Duration::from_millis(20));

        let err = t.handle(ctx, &mut stream).await.unwrap_err();

        assert!(matches!(err, CallError::DeadlineExceeded));
        assert_eq!(Status::from(err).code(), Code::DeadlineExceeded);
        assert_eq!(t.pool().stats().in_use, 0);
    }

    #[tokio::test]
    async fn test_pool_exhausted() {
        let t = translator(ScriptedConnector::ok("OK"), 1);
        let _held = t.pool().acquire().await.unwrap();
        let mut stream = RecordingStream::with_frames(&[b"request"]);

        let err = t.handle(context(), &mut stream).await.unwrap_err();

        assert!(matches!(err, CallError::Unavailable(_)));
        assert_eq!(Status::from(err).code(), Code::Internal);
        assert_eq!(t.pool().stats().in_use, 1);
    }

    #[tokio::test]
    async fn test_backend_transport_error_discards_connection() {
        let t = translator(ScriptedConnector::new(|| Err(BackendError::Closed)), 1);
        let mut stream = RecordingStream::with_frames(&[b"request"]);

        let err = t.handle(context(), &mut stream).await.unwrap_err();

        assert!(matches!(err, CallError::Backend(_)));
        assert!(Status::from(err).message().contains("fastcgi request failed"));
        let stats = t.pool().stats();
        assert_eq!(stats.in_use, 0);
        assert_eq!(stats.discarded, 1);
    }

    #[test]
    fn test_phase_only_moves_forward() {
        let mut phase = CallPhase::Start;
        phase.advance(CallPhase::AwaitingInboundFrame);
        phase.advance(CallPhase::BackendCallInFlight);
        phase.advance(CallPhase::Failed);
        assert!(phase.is_terminal());
        phase.advance(CallPhase::Done);
        assert_eq!(phase, CallPhase::Done);
        assert_eq!(phase.to_string(), "done");
    }

    #[tokio::test]
    async fn test_failures_report_the_phase_they_happened_in() {
        let t = translator(ScriptedConnector::ok("OK"), 1);
        let mut stream = RecordingStream::with_frames(&[]);
        let (phase, result) = t.execute(&context(), &mut stream).await;
        assert!(matches!(result, Err(CallError::ProtocolViolation(_))));
        assert_eq!(phase, CallPhase::AwaitingInboundFrame);

        let t = translator(
            ScriptedConnector::new(|| {
                Ok(BackendResponse::new(StatusCode::INTERNAL_SERVER_ERROR, "boom"))
            }),
            1,
        );
        let mut stream = RecordingStream::with_frames(&[b"request"]);
        let (phase, result) = t.execute(&context(), &mut stream).await;
        assert!(matches!(result, Err(CallError::BackendStatus { status: 500, .. })));
        assert_eq!(phase, CallPhase::BackendCallInFlight);

        let t = translator(ScriptedConnector::ok("OK"), 1);
        let mut stream = RecordingStream::with_frames(&[b"request"]);
        let (phase, result) = t.execute(&context(), &mut stream).await;
        assert!(result.is_ok());
        assert_eq!(phase, CallPhase::BackendCallInFlight);
        assert_eq!(stream.events, ["metadata", "frame"]);
    }

    #[test]
    #[should_panic(expected = "invalid call transition")]
    #[cfg(debug_assertions)]
    fn test_phase_rejects_going_back() {
        let mut phase = CallPhase::BackendCallInFlight;
        phase.advance(CallPhase::AwaitingInboundFrame);
    }
}
