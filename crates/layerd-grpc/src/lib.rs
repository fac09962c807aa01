//! `layerd-grpc` — Unix socket provisioning and the containerd snapshots
//! gRPC server.

pub mod server;
pub mod transport;

pub use server::{report_serve_failure, serve, serve_incoming, spawn, ServerHandle};
pub use transport::provision;
