//! Per-request SSE session handling (spec.md component G): a request
//! enters here, a fingerprint/caller id resolves a task identity, and the
//! body streams either a cache replay, a live attachment to a running
//! task, or a freshly spawned job — disconnecting the client never stops
//! the underlying job.

pub mod cors;
pub mod request;
pub mod server;
pub mod sse;
pub mod stream_manager;

pub use cors::CorsLayer;
pub use request::IncomingRequest;
pub use server::{ServerConfig, SseServer, SseServerBuilder};
