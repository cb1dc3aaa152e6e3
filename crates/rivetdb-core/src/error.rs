use thiserror::Error;

/// All errors that RivetDB can produce.
#[derive(Debug, Error)]
pub enum RivetError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: record update conflict")]
    Conflict,

    #[error("corrupt revision data: {0}")]
    CorruptRevisionData(String),

    #[error("corrupt index data: {0}")]
    CorruptIndexData(String),

    #[error("unsupported encryption algorithm")]
    UnsupportedEncryption,

    #[error("invalid version vector: {0}")]
    BadVersionVector(String),

    #[error("database is not open")]
    NotOpen,

    #[error("database is busy: {0}")]
    Busy(String),

    #[error("cryptographic failure: {0}")]
    CryptoError(String),

    #[error("unknown delta base revision: {0}")]
    DeltaBaseUnknown(String),

    #[error("corrupt delta: {0}")]
    CorruptDelta(String),

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("remote error {domain}/{code}: {message}")]
    RemoteError {
        domain: String,
        code: i32,
        message: String,
    },

    #[error("unexpected error: {0}")]
    UnexpectedError(String),

    #[error("storage error: {0}")]
    StorageError(String),

    #[error("network error: {0}")]
    Network(NetworkError),

    #[error("websocket closed with code {code}: {reason}")]
    WebSocket { code: u16, reason: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors arising from the network transport, distinct from protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NetworkError {
    #[error("DNS lookup failed")]
    DnsFailure,
    #[error("unknown host")]
    UnknownHost,
    #[error("connection timed out")]
    Timeout,
    #[error("invalid URL")]
    InvalidUrl,
    #[error("too many redirects")]
    TooManyRedirects,
    #[error("TLS handshake failed")]
    TlsHandshake,
    #[error("server certificate expired")]
    CertExpired,
    #[error("server certificate untrusted")]
    CertUntrusted,
    #[error("client certificate required")]
    ClientCertRequired,
    #[error("client certificate rejected")]
    ClientCertRejected,
    #[error("certificate signed by unknown root")]
    CertUnknownRoot,
    #[error("invalid redirect")]
    InvalidRedirect,
    #[error("connection reset: {0}")]
    ConnectionReset(String),
}

/// The error domain reported through the public error envelope and the wire
/// protocol's `Error-Domain` property.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorDomain {
    Rivet,
    Posix,
    Storage,
    Encoding,
    Network,
    WebSocket,
}

impl ErrorDomain {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorDomain::Rivet => "RivetDB",
            ErrorDomain::Posix => "POSIX",
            ErrorDomain::Storage => "Storage",
            ErrorDomain::Encoding => "Encoding",
            ErrorDomain::Network => "Network",
            ErrorDomain::WebSocket => "WebSocket",
        }
    }
}

impl RivetError {
    /// Helper for wrapping storage-engine errors.
    pub fn storage(err: impl std::fmt::Display) -> Self {
        RivetError::StorageError(err.to_string())
    }

    pub fn domain(&self) -> ErrorDomain {
        match self {
            RivetError::Io(_) => ErrorDomain::Posix,
            RivetError::StorageError(_) => ErrorDomain::Storage,
            RivetError::Json(_) => ErrorDomain::Encoding,
            RivetError::Network(_) => ErrorDomain::Network,
            RivetError::WebSocket { .. } => ErrorDomain::WebSocket,
            _ => ErrorDomain::Rivet,
        }
    }

    /// A stable numeric code within the error's domain, used by the wire
    /// protocol's error envelope.
    pub fn code(&self) -> i32 {
        match self {
            RivetError::NotFound(_) => 1,
            RivetError::Conflict => 2,
            RivetError::CorruptRevisionData(_) => 3,
            RivetError::CorruptIndexData(_) => 4,
            RivetError::UnsupportedEncryption => 5,
            RivetError::BadVersionVector(_) => 6,
            RivetError::NotOpen => 7,
            RivetError::Busy(_) => 8,
            RivetError::CryptoError(_) => 9,
            RivetError::DeltaBaseUnknown(_) => 10,
            RivetError::CorruptDelta(_) => 11,
            RivetError::InvalidParameter(_) => 12,
            RivetError::RemoteError { code, .. } => *code,
            RivetError::UnexpectedError(_) => 13,
            RivetError::StorageError(_) => 1,
            RivetError::Network(n) => n.code(),
            RivetError::WebSocket { code, .. } => i32::from(*code),
            RivetError::Io(e) => e.raw_os_error().unwrap_or(-1),
            RivetError::Json(_) => 1,
        }
    }

    /// True for errors the replicator may retry after a backoff delay, as
    /// opposed to fatal configuration or data errors.
    pub fn is_transient(&self) -> bool {
        match self {
            RivetError::Busy(_) => true,
            RivetError::Network(n) => {
                matches!(
                    n,
                    NetworkError::Timeout
                        | NetworkError::DnsFailure
                        | NetworkError::ConnectionReset(_)
                )
            }
            RivetError::WebSocket { code, .. } => *code == 1001 || *code >= 1011,
            RivetError::Io(_) => true,
            _ => false,
        }
    }
}

impl NetworkError {
    pub fn code(&self) -> i32 {
        match self {
            NetworkError::DnsFailure => 1,
            NetworkError::UnknownHost => 2,
            NetworkError::Timeout => 3,
            NetworkError::InvalidUrl => 4,
            NetworkError::TooManyRedirects => 5,
            NetworkError::TlsHandshake => 6,
            NetworkError::CertExpired => 7,
            NetworkError::CertUntrusted => 8,
            NetworkError::ClientCertRequired => 9,
            NetworkError::ClientCertRejected => 10,
            NetworkError::CertUnknownRoot => 11,
            NetworkError::InvalidRedirect => 12,
            NetworkError::ConnectionReset(_) => 13,
        }
    }
}

impl From<NetworkError> for RivetError {
    fn from(err: NetworkError) -> Self {
        RivetError::Network(err)
    }
}

pub type Result<T> = std::result::Result<T, RivetError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domains_and_codes() {
        assert_eq!(RivetError::Conflict.domain(), ErrorDomain::Rivet);
        assert_eq!(RivetError::Conflict.code(), 2);

        let net = RivetError::from(NetworkError::Timeout);
        assert_eq!(net.domain(), ErrorDomain::Network);
        assert_eq!(net.code(), 3);
        assert!(net.is_transient());

        let ws = RivetError::WebSocket {
            code: 1008,
            reason: "policy".into(),
        };
        assert_eq!(ws.domain(), ErrorDomain::WebSocket);
        assert!(!ws.is_transient());
    }

    #[test]
    fn remote_error_carries_peer_code() {
        let err = RivetError::RemoteError {
            domain: "RivetDB".into(),
            code: 2,
            message: "conflict".into(),
        };
        assert_eq!(err.code(), 2);
    }
}
