//! Transport Adapters (C9): bidirectional RPC and an HTTP/SSE gateway over
//! the [`ktl_mirror::MirrorHub`] (`spec.md` §4.5).

pub mod auth;
pub mod error;
pub mod grpc;
pub mod http;
pub mod serve;

pub mod proto {
    tonic::include_proto!("ktl.mirror.v1");
}

pub use auth::{AuthConfig, TokenStore};
pub use error::TransportError;
pub use grpc::MirrorGrpcService;
pub use http::{router, GatewayState};
pub use proto::mirror_service_server::MirrorServiceServer;
