use thiserror::Error;

/// Comprehensive error types for scanner operations
#[derive(Error, Debug)]
pub enum ScanError {
    #[error("Configuration Error: {0}")]
    ConfigError(String),

    #[error("Discovery Error: {0}")]
    DiscoveryError(String),

    #[error("Blacklist Error: {0}")]
    BlacklistError(String),

    #[error("Geolocation Error: {0}")]
    GeolocationError(String),

    #[error("Storage Error: {0}")]
    StorageError(String),

    #[error("Webhook Error: {0}")]
    WebhookError(String),

    #[error("Module Error in {module}: {message}")]
    ModuleError { module: String, message: String },

    #[error("Scan Aborted: {0}")]
    Aborted(String),

    #[error("I/O Error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Error: {0}")]
    Other(String),
}

/// Why a status exchange could not be decoded off the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ProtocolErrorKind {
    /// Stream ended in the middle of a field
    Truncated,
    /// Packet structure did not match the expected framing
    BadFrame,
    /// Status payload was not valid JSON or missed mandatory fields
    BadJson,
    /// VarInt used more than five bytes
    Overflow,
    /// Declared string or packet length above the safety cap
    StringTooLong,
    /// First response packet carried an id other than 0x00
    UnexpectedPacketId,
    /// Peer answered with a pre-Netty text frame while legacy support is off
    Legacy,
}

impl std::fmt::Display for ProtocolErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Truncated => "truncated",
            Self::BadFrame => "bad-frame",
            Self::BadJson => "bad-json",
            Self::Overflow => "overflow",
            Self::StringTooLong => "string-too-long",
            Self::UnexpectedPacketId => "unexpected-packet-id",
            Self::Legacy => "legacy",
        };
        f.write_str(s)
    }
}

/// Terminal failure of a single probe.
///
/// Transient kinds (`Timeout`, `Reset`) are retried by the protocol engine
/// before one of these is surfaced; the rest terminate the attempt on first
/// occurrence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeFailure {
    Timeout,
    Refused,
    Reset,
    Unreachable,
    Protocol(ProtocolErrorKind),
    /// Peer opened with a TLS record where a Minecraft frame was expected
    TlsUnexpected,
    /// Local descriptor exhaustion (EMFILE/ENFILE); the worker backs off
    /// and repeated hits escalate to shutdown
    Exhausted,
}

impl ProbeFailure {
    /// Transient failures are worth another connection attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout | Self::Reset)
    }

    /// Classify a socket-level error from connect/read/write.
    pub fn from_io(err: &std::io::Error) -> Self {
        use std::io::ErrorKind;
        // EMFILE / ENFILE need their own lane before the generic mapping
        if matches!(err.raw_os_error(), Some(23) | Some(24)) {
            return Self::Exhausted;
        }
        match err.kind() {
            ErrorKind::TimedOut => Self::Timeout,
            ErrorKind::ConnectionRefused => Self::Refused,
            ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::BrokenPipe => {
                Self::Reset
            }
            ErrorKind::HostUnreachable | ErrorKind::NetworkUnreachable => Self::Unreachable,
            ErrorKind::UnexpectedEof => Self::Protocol(ProtocolErrorKind::Truncated),
            _ => Self::Reset,
        }
    }
}

impl std::fmt::Display for ProbeFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout => f.write_str("timeout"),
            Self::Refused => f.write_str("refused"),
            Self::Reset => f.write_str("reset"),
            Self::Unreachable => f.write_str("unreachable"),
            Self::Protocol(kind) => write!(f, "protocol error ({kind})"),
            Self::TlsUnexpected => f.write_str("unexpected TLS greeting"),
            Self::Exhausted => f.write_str("descriptor exhaustion"),
        }
    }
}
