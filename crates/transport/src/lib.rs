//! Streaming transport for chat exchanges.
//!
//! A [`ChatTransport`] POSTs a [`ChatRequest`] and hands back a
//! [`TransportReader`] that yields decoded text fragments in arrival order
//! until the body ends or the session's cancellation token fires.
#![deny(unsafe_code)]

mod decoder;
mod error;
mod http;
mod reader;
mod request;

pub use decoder::Utf8ChunkDecoder;
pub use error::{TransportError, TransportResult};
pub use http::{
    BoxFuture, ChatTransport, DEFAULT_BASE_URL, DEFAULT_CHAIN_PATH, DEFAULT_COMPLETION_PATH,
    HttpTransport, HttpTransportConfig,
};
pub use reader::{ByteStream, TransportReader};
pub use request::{ChatRequest, Endpoint, ModelConfigs, WireMessage, WireRole};
pub use tokio_util::sync::CancellationToken;
