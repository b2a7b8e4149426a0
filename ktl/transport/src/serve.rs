//! Runs both transports side by side and tears both down together on
//! cancellation (`spec.md` §4.5: "Two transports expose the hub").

use std::net::SocketAddr;
use std::sync::Arc;

use ktl_mirror::MirrorHub;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server as GrpcServer;

use crate::{auth::AuthConfig, http::GatewayState, grpc::MirrorGrpcService, TokenStore};

#[derive(Debug, thiserror::Error)]
pub enum ServeError {
    #[error("http gateway: {0}")]
    Http(#[from] std::io::Error),

    #[error("grpc server: {0}")]
    Grpc(#[from] tonic::transport::Error),
}

pub struct ServeConfig {
    pub grpc_addr: SocketAddr,
    pub http_addr: SocketAddr,
    pub mirror_config: ktl_config::MirrorConfig,
    pub shared_secret: String,
}

/// Serves the gRPC and HTTP/SSE gateways concurrently until `cancel` fires.
/// Either server exiting early (a bind error, a panic in an acceptor) stops
/// the other via `cancel` as well, mirroring the run-level cancellation
/// semantics the Stack Runner uses for its own workers.
pub async fn serve(
    hub: Arc<MirrorHub>,
    config: ServeConfig,
    cancel: CancellationToken,
) -> Result<(), ServeError> {
    let auth = AuthConfig::new(config.shared_secret);
    let tokens = TokenStore::new();

    let grpc_service = MirrorGrpcService::new(Arc::clone(&hub));
    let grpc_cancel = cancel.clone();
    let grpc = GrpcServer::builder()
        .add_service(crate::MirrorServiceServer::new(grpc_service))
        .serve_with_shutdown(config.grpc_addr, async move { grpc_cancel.cancelled().await });

    let gateway_state = GatewayState {
        hub,
        mirror_config: config.mirror_config,
        auth,
        tokens,
    };
    let app = crate::http::router(gateway_state);
    let http_cancel = cancel.clone();
    let listener = tokio::net::TcpListener::bind(config.http_addr).await?;
    let http = axum::serve(listener, app).with_graceful_shutdown(async move {
        http_cancel.cancelled().await;
    });

    tokio::select! {
        result = grpc => {
            cancel.cancel();
            result?;
        }
        result = http => {
            cancel.cancel();
            result?;
        }
    }

    Ok(())
}
