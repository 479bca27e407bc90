//! IPC bridge between a controller and its test hosts.
//!
//! # Architecture
//!
//! - **wire**: field grammar (ids, wire kinds, self-delimiting payloads)
//! - **registry**: message shapes, typed messages, per-family registry
//! - **protocol**: system and echo message types
//! - **codec**: length-prefixed frame codec for AsyncRead/AsyncWrite
//! - **transport**: Unix socket endpoints, listener and backoff connect

pub mod codec;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod transport;
pub mod wire;

pub use codec::{CorrelationId, Frame, FrameCodec};
pub use error::ProtocolError;
pub use registry::{Message, MessageKind, MessageShape, MessageTypeId, SerializerRegistry, WireMessage};
pub use transport::{Channel, ChannelError, ChannelListener, EndpointName};
pub use wire::{FieldValue, Fields, WireKind};
