//! HTTP transport between cluster nodes.
//!
//! [`HttpTransport`] ships MsgPack-encoded [`apm_core::RemoteMessage`]s to
//! peers; [`remote_router`] is the receiving side, handing them to the
//! node's [`crate::worker::ClusterWorkerContext`].

pub mod routes;
pub mod transport;

// Re-exports: flat public API
pub use routes::{remote_router, serve, DEFAULT_MAX_BODY_BYTES};
pub use transport::{HttpTransport, MSGPACK_CONTENT_TYPE, REMOTE_PATH};
