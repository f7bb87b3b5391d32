//! Overlay error types.

use std::time::Duration;

/// Errors that can occur in the weft_net crate.
///
/// Only protocol-structural failures surface here. Delivery failures
/// (ttl exhaustion, unreachable destination) travel as ordinary packets
/// with the error flag set, because they are a property of the overlay
/// rather than the local call.
#[derive(Debug, thiserror::Error)]
pub enum NetError {
    /// The requested port number is already bound on the interface.
    #[error("Port {0} is already bound")]
    PortInUse(u16),

    /// No port with this number is open on the interface.
    #[error("Port {0} is not open")]
    UnknownPort(u16),

    /// The anonymous port counter wrapped.
    #[error("Anonymous port numbers exhausted")]
    PortsExhausted,

    /// The next anonymous port number collided with a bound port.
    #[error("Anonymous port collision at {0}")]
    PortCollision(u16),

    /// The port was destroyed while a reply was still pending.
    #[error("Port closed before a reply arrived")]
    PortClosed,

    /// JSON serialization / deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A wire frame did not have the expected structure.
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// Encryption, decryption, or key derivation failed.
    #[error("Crypto failure: {0}")]
    Crypto(String),

    /// The session handshake was rejected.
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// A handshake step made no progress within its window.
    #[error("Handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    /// The socket has not completed a handshake.
    #[error("Socket is not connected")]
    NotConnected,

    /// A transport-level error (WebSocket connect/send/receive).
    #[error("Transport error: {0}")]
    Transport(String),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Logging initialization failed.
    #[error("Logging setup failed: {0}")]
    Logging(String),
}
