/// Errors reported by the U-BMS library.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Arbitration id outside the 11-bit range or payload longer than 8 bytes.
    #[error("Value out of range")]
    RangeError,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// A frame could not be sent or received. Retried by the caller on the next period.
    #[error("Transport error: {0}")]
    Transport(String),
    /// Requested mode is not one of standby (0), charge (1) or drive (2).
    #[error("Invalid mode {0}, expected 0 (standby), 1 (charge) or 2 (drive)")]
    InvalidMode(u8),
    /// A mode change was requested before the keep-alive was armed.
    #[error("Mode command keep-alive is not armed")]
    NotArmed,
    #[error("No battery detected: handshake timed out")]
    HandshakeTimeout,
    #[error(
        "No battery detected: reported voltage {reported}V does not match configured {configured}V"
    )]
    HandshakeMismatch { reported: f32, configured: f32 },
    #[error("Settings error: {0}")]
    Settings(#[from] serde_yaml::Error),
}
