use thiserror::Error;

/// Transport-facing error, mapped to gRPC `Status` / HTTP status codes at
/// each adapter's boundary (`spec.md` §6 "Authentication failures return
/// `401`; invalid session `404`").
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("missing or invalid credentials")]
    Unauthorized,

    #[error("unknown mirror session {0}")]
    NotFound(String),

    #[error(transparent)]
    Mirror(#[from] ktl_mirror::MirrorError),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl TransportError {
    pub fn http_status(&self) -> http::StatusCode {
        match self {
            Self::Unauthorized => http::StatusCode::UNAUTHORIZED,
            Self::NotFound(_) => http::StatusCode::NOT_FOUND,
            Self::Mirror(ktl_mirror::MirrorError::UnknownSession(_)) => http::StatusCode::NOT_FOUND,
            Self::Mirror(_) => http::StatusCode::INTERNAL_SERVER_ERROR,
            Self::InvalidRequest(_) => http::StatusCode::BAD_REQUEST,
        }
    }

    pub fn grpc_status(&self) -> tonic::Status {
        match self {
            Self::Unauthorized => tonic::Status::unauthenticated(self.to_string()),
            Self::NotFound(_) => tonic::Status::not_found(self.to_string()),
            Self::Mirror(ktl_mirror::MirrorError::UnknownSession(id)) => {
                tonic::Status::not_found(format!("unknown mirror session {id}"))
            }
            Self::Mirror(_) => tonic::Status::internal(self.to_string()),
            Self::InvalidRequest(_) => tonic::Status::invalid_argument(self.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_session_maps_to_not_found_on_both_surfaces() {
        let err = TransportError::Mirror(ktl_mirror::MirrorError::UnknownSession("s1".into()));
        assert_eq!(err.http_status(), http::StatusCode::NOT_FOUND);
        assert_eq!(err.grpc_status().code(), tonic::Code::NotFound);
    }

    #[test]
    fn unauthorized_maps_to_401_and_unauthenticated() {
        let err = TransportError::Unauthorized;
        assert_eq!(err.http_status(), http::StatusCode::UNAUTHORIZED);
        assert_eq!(err.grpc_status().code(), tonic::Code::Unauthenticated);
    }
}
