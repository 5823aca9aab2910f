//! Pass-through gRPC codec
//!
//! Lets the bridge forward messages without knowing their schema: a [`Frame`]
//! is written and read as the raw bytes of the gRPC message. Any other message
//! type goes through a fallback codec (protobuf by default).
//!
//! The choice between the two paths is made by the type parameters of
//! [`PassthroughCodec`], so each call site is resolved at compile time:
//!
//! ```
//! use grpc_fastcgi_bridge::codec::{Fallback, Frame, PassthroughCodec};
//! use tonic_prost::ProstCodec;
//!
//! // Raw frames in both directions (what the bridge itself uses)
//! let _raw: PassthroughCodec<ProstCodec<(), ()>> = PassthroughCodec::frames();
//!
//! // Typed protobuf messages out, raw frames back
//! let _mixed = PassthroughCodec::<ProstCodec<String, ()>, Fallback<String>, Frame>::with_fallback(
//!     ProstCodec::default(),
//! );
//! ```

use bytes::{Buf, BufMut, Bytes};
use std::marker::PhantomData;
use tonic::Status;
use tonic::codec::{BufferSettings, Codec, DecodeBuf, Decoder, EncodeBuf, Encoder};

/// An opaque gRPC message: the payload is never interpreted
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Frame {
    pub payload: Bytes,
}

impl Frame {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
        }
    }

    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Write the payload unchanged
    pub fn write_to<B: BufMut>(&self, dst: &mut B) {
        dst.put_slice(&self.payload);
    }

    /// Take everything left in `src` as the payload
    pub fn read_from<B: Buf>(src: &mut B) -> Self {
        Self {
            payload: src.copy_to_bytes(src.remaining()),
        }
    }
}

/// A message handled by the fallback codec
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Fallback<T>(pub T);

/// Outgoing message type of a [`PassthroughCodec`]
pub trait Outbound<F: Codec>: Sized + Send + 'static {
    fn encode(self, fallback: &mut F::Encoder, dst: &mut EncodeBuf<'_>) -> Result<(), Status>;
}

/// Incoming message type of a [`PassthroughCodec`]
pub trait Inbound<F: Codec>: Sized + Send + 'static {
    fn decode(fallback: &mut F::Decoder, src: &mut DecodeBuf<'_>) -> Result<Option<Self>, Status>;
}

impl<F: Codec> Outbound<F> for Frame {
    fn encode(self, _fallback: &mut F::Encoder, dst: &mut EncodeBuf<'_>) -> Result<(), Status> {
        self.write_to(dst);
        Ok(())
    }
}

impl<F: Codec> Inbound<F> for Frame {
    fn decode(_fallback: &mut F::Decoder, src: &mut DecodeBuf<'_>) -> Result<Option<Self>, Status> {
        Ok(Some(Frame::read_from(src)))
    }
}

impl<F: Codec> Outbound<F> for Fallback<F::Encode> {
    fn encode(self, fallback: &mut F::Encoder, dst: &mut EncodeBuf<'_>) -> Result<(), Status> {
        fallback.encode(self.0, dst)
    }
}

impl<F: Codec> Inbound<F> for Fallback<F::Decode> {
    fn decode(fallback: &mut F::Decoder, src: &mut DecodeBuf<'_>) -> Result<Option<Self>, Status> {
        Ok(fallback.decode(src)?.map(Fallback))
    }
}

/// Codec used by the bridge: raw frames both ways, protobuf never reached
pub type FrameCodec = PassthroughCodec<tonic_prost::ProstCodec<(), ()>, Frame, Frame>;

/// gRPC codec that passes [`Frame`]s through untouched and delegates
/// [`Fallback`] messages to `F`
pub struct PassthroughCodec<F, E = Frame, D = Frame> {
    fallback: F,
    _messages: PhantomData<fn() -> (E, D)>,
}

impl<F: Default> PassthroughCodec<F, Frame, Frame> {
    /// Raw frames in both directions
    pub fn frames() -> Self {
        Self::with_fallback(F::default())
    }
}

impl<F, E, D> PassthroughCodec<F, E, D> {
    pub fn with_fallback(fallback: F) -> Self {
        Self {
            fallback,
            _messages: PhantomData,
        }
    }

    /// `proxy>` followed by the fallback codec's type name
    pub fn name(&self) -> String {
        format!("proxy>{}", std::any::type_name::<F>())
    }
}

impl<F: Default, E, D> Default for PassthroughCodec<F, E, D> {
    fn default() -> Self {
        Self::with_fallback(F::default())
    }
}

impl<F, E, D> std::fmt::Debug for PassthroughCodec<F, E, D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name())
    }
}

impl<F, E, D> Codec for PassthroughCodec<F, E, D>
where
    F: Codec + 'static,
    E: Outbound<F>,
    D: Inbound<F>,
{
    type Encode = E;
    type Decode = D;
    type Encoder = PassthroughEncoder<F, E>;
    type Decoder = PassthroughDecoder<F, D>;

    fn encoder(&mut self) -> Self::Encoder {
        PassthroughEncoder {
            fallback: self.fallback.encoder(),
            _item: PhantomData,
        }
    }

    fn decoder(&mut self) -> Self::Decoder {
        PassthroughDecoder {
            fallback: self.fallback.decoder(),
            _item: PhantomData,
        }
    }
}

pub struct PassthroughEncoder<F: Codec, E> {
    fallback: F::Encoder,
    _item: PhantomData<fn(E)>,
}

impl<F: Codec, E: Outbound<F>> Encoder for PassthroughEncoder<F, E> {
    type Item = E;
    type Error = Status;

    fn encode(&mut self, item: E, dst: &mut EncodeBuf<'_>) -> Result<(), Status> {
        item.encode(&mut self.fallback, dst)
    }

    fn buffer_settings(&self) -> BufferSettings {
        self.fallback.buffer_settings()
    }
}

pub struct PassthroughDecoder<F: Codec, D> {
    fallback: F::Decoder,
    _item: PhantomData<fn() -> D>,
}

impl<F: Codec, D: Inbound<F>> Decoder for PassthroughDecoder<F, D> {
    type Item = D;
    type Error = Status;

    fn decode(&mut self, src: &mut DecodeBuf<'_>) -> Result<Option<D>, Status> {
        D::decode(&mut self.fallback, src)
    }

    fn buffer_settings(&self) -> BufferSettings {
        self.fallback.buffer_settings()
    }
}
