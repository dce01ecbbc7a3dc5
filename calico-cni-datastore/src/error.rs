use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid datastore config: {0}")]
    InvalidConfig(String),

    #[error("resource version conflict on {namespace}/{name}")]
    Conflict { namespace: String, name: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Etcd(#[from] etcd_client::Error),

    #[error(transparent)]
    Kube(#[from] kube::Error),
}

impl Error {
    /// True when a mutation lost an optimistic-concurrency race and the
    /// caller should re-read and retry.
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::Conflict { .. } => true,
            Error::Kube(kube::Error::Api(resp)) => resp.code == 409,
            _ => false,
        }
    }
}
