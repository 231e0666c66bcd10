//! Client error types for the sregistry SDK

/// Error type for registry client operations
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Bad registration input; never retried
    #[error("invalid instance: {0}")]
    InvalidInstance(String),

    /// Credentials could not be refreshed and the cached ones are expired
    #[error("auth expired: {0}")]
    AuthExpired(String),

    #[error("instance not found: service={service}, ip={ip}, port={port}")]
    InstanceNotFound {
        service: String,
        ip: String,
        port: u16,
    },

    #[error("no healthy instance available for service {service}")]
    NoHealthyInstance { service: String },

    /// Every endpoint failed within the configured attempt budget
    #[error("registry unreachable after {attempts} attempts: {message}")]
    RegistryUnreachable { attempts: usize, message: String },

    #[error("server returned error: code={code}, message={message}")]
    ServerError { code: u16, message: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("client is shut down")]
    Shutdown,

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl ClientError {
    /// Whether the failure is a transport-level one worth retrying later
    pub fn is_unreachable(&self) -> bool {
        matches!(self, ClientError::RegistryUnreachable { .. })
    }
}

impl From<validator::ValidationError> for ClientError {
    fn from(err: validator::ValidationError) -> Self {
        ClientError::InvalidInstance(err.code.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;
