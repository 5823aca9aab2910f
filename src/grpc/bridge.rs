//! Universal gRPC handler: every method path goes through the translator

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use std::convert::Infallible;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tonic::codec::CompressionEncoding;
use tonic::metadata::MetadataMap;
use tonic::server::{Grpc, StreamingService};
use tonic::{Status, Streaming};
use tower::Service;

use crate::backend::Connector;
use crate::codec::{Frame, FrameCodec};
use crate::metadata::Metadata;
use crate::translator::{CallContext, CallStream, CallTranslator};

type FrameStream = BoxStream<'static, Result<Frame, Status>>;

/// Tower service that accepts any gRPC method and bridges it to the backend
///
/// Meant to be mounted as a fallback service so that no method has to be
/// registered up front.
pub struct GrpcBridge<C: Connector> {
    translator: CallTranslator<C>,
    max_message_size: usize,
}

impl<C: Connector> Clone for GrpcBridge<C> {
    fn clone(&self) -> Self {
        Self {
            translator: self.translator.clone(),
            max_message_size: self.max_message_size,
        }
    }
}

impl<C: Connector> GrpcBridge<C> {
    pub fn new(translator: CallTranslator<C>, max_message_size: usize) -> Self {
        Self {
            translator,
            max_message_size,
        }
    }

    pub fn translator(&self) -> &CallTranslator<C> {
        &self.translator
    }
}

impl<C: Connector> Service<http::Request<axum::body::Body>> for GrpcBridge<C> {
    type Response = http::Response<tonic::body::Body>;
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<Self::Response, Infallible>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: http::Request<axum::body::Body>) -> Self::Future {
        let call = BridgeCall {
            translator: self.translator.clone(),
            method: req.uri().path().to_string(),
            metadata: Metadata::from_request_parts(req.uri(), req.headers()),
            timeout: Metadata::timeout_from_headers(req.headers()),
        };
        let max_message_size = self.max_message_size;

        Box::pin(async move {
            let mut grpc = Grpc::new(FrameCodec::frames())
                .accept_compressed(CompressionEncoding::Gzip)
                .max_decoding_message_size(max_message_size)
                .max_encoding_message_size(max_message_size);
            Ok(grpc.streaming(call, req).await)
        })
    }
}

/// One inbound call, before its request stream is available
struct BridgeCall<C: Connector> {
    translator: CallTranslator<C>,
    method: String,
    metadata: Metadata,
    timeout: Option<Duration>,
}

impl<C: Connector> StreamingService<Frame> for BridgeCall<C> {
    type Response = Frame;
    type ResponseStream = FrameStream;
    type Future = BoxFuture<'static, Result<tonic::Response<FrameStream>, Status>>;

    fn call(&mut self, request: tonic::Request<Streaming<Frame>>) -> Self::Future {
        let mut ctx = CallContext::new(
            std::mem::take(&mut self.method),
            std::mem::take(&mut self.metadata),
        );
        if let Some(timeout) = self.timeout {
            ctx = ctx.with_timeout(timeout);
        }
        let translator = self.translator.clone();

        Box::pin(serve_call(translator, ctx, request.into_inner()))
    }
}

/// Run the translator on its own task and hand its output to tonic
///
/// Response metadata resolves the returned future; the response message and
/// any later error flow through the response stream. Dropping the future or
/// the stream (peer gone) cancels the call.
async fn serve_call<C: Connector>(
    translator: CallTranslator<C>,
    ctx: CallContext,
    inbound: Streaming<Frame>,
) -> Result<tonic::Response<FrameStream>, Status> {
    let cancel = CancellationToken::new();
    let guard = cancel.clone().drop_guard();
    let ctx = ctx.with_cancellation(cancel);

    let (header_tx, header_rx) = oneshot::channel();
    let (frame_tx, mut frame_rx) = mpsc::channel(1);

    let task = tokio::spawn(async move {
        let mut call = TonicCall {
            inbound,
            header_tx: Some(header_tx),
            frames: frame_tx,
        };
        match translator.handle(ctx, &mut call).await {
            Ok(()) => Ok(()),
            Err(e) if call.header_tx.is_none() => {
                // Headers are out, so the status travels in the trailers
                let _ = call.frames.send(Err(Status::from(e))).await;
                Ok(())
            }
            Err(e) => Err(Status::from(e)),
        }
    });

    match header_rx.await {
        Ok(metadata) => {
            let stream = async_stream::stream! {
                let _guard = guard;
                while let Some(item) = frame_rx.recv().await {
                    yield item;
                }
            };
            Ok(tonic::Response::from_parts(
                metadata,
                Box::pin(stream) as FrameStream,
                tonic::Extensions::default(),
            ))
        }
        Err(_) => match task.await {
            Ok(Err(status)) => Err(status),
            Ok(Ok(())) => Err(Status::internal("call finished without a response")),
            Err(e) => {
                tracing::error!(error = %e, "Call task failed");
                Err(Status::internal("call task failed"))
            }
        },
    }
}

/// [`CallStream`] over a tonic request stream and the response channels
struct TonicCall {
    inbound: Streaming<Frame>,
    header_tx: Option<oneshot::Sender<MetadataMap>>,
    frames: mpsc::Sender<Result<Frame, Status>>,
}

#[async_trait::async_trait]
impl CallStream for TonicCall {
    async fn recv_frame(&mut self) -> Result<Option<Frame>, Status> {
        self.inbound.message().await
    }

    async fn send_metadata(&mut self, metadata: MetadataMap) -> Result<(), Status> {
        let tx = self
            .header_tx
            .take()
            .ok_or_else(|| Status::internal("response metadata already sent"))?;
        tx.send(metadata)
            .map_err(|_| Status::cancelled("call abandoned before response metadata"))
    }

    async fn send_frame(&mut self, frame: Frame) -> Result<(), Status> {
        if self.header_tx.is_some() {
            return Err(Status::internal("response message before metadata"));
        }
        self.frames
            .send(Ok(frame))
            .await
            .map_err(|_| Status::cancelled("response stream closed"))
    }
}
