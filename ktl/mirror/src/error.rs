use ktl_protocol::ErrorKind;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MirrorError {
    #[error("unknown mirror session {0}")]
    UnknownSession(String),

    #[error(transparent)]
    Store(#[from] ktl_store::StoreError),
}

impl MirrorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnknownSession(_) => ErrorKind::NodePermanent,
            Self::Store(ktl_store::StoreError::SessionNotFound(_)) => ErrorKind::NodePermanent,
            Self::Store(_) => ErrorKind::NodePermanent,
        }
    }
}
