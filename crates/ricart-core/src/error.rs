//! Error types for the ricart broker and lock.
//!
//! Every variant maps to a stable wire name so that a skeleton can answer a
//! failed dispatch with a well-formed `{"error": {"name", "args"}}` record.

use crate::wire::RemoteFault;
use crate::PeerId;
use serde_json::Value;
use thiserror::Error;

/// Main error type for the ricart library.
#[derive(Debug, Error)]
pub enum OrbError {
    // Wire errors
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    #[error("Remote error {name}: {args:?}")]
    Remote { name: String, args: Vec<Value> },

    #[error("Invalid arguments for {method}: {message}")]
    InvalidArguments { method: String, message: String },

    // Transport errors
    #[error("Communication error with {addr}: {message}")]
    Communication {
        addr: String,
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    /// The request left this peer but no response came back, so whether the
    /// remote acted on it is unknown.
    #[error("No response from {addr} after sending the request: {message}")]
    ResponseLost {
        addr: String,
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Cannot resolve an external address for {host:?}: {message}")]
    AddressResolution { host: String, message: String },

    // Lock errors
    #[error("Lock is already held or being acquired by this peer")]
    LockBusy,

    #[error("Lock is not held by this peer")]
    LockNotHeld,

    #[error("Lock has been destroyed")]
    LockClosed,

    // Membership errors
    #[error("Unknown peer: {0}")]
    UnknownPeer(PeerId),

    #[error("Peer is not registered with the name service")]
    NotRegistered,

    #[error("Invalid identity for peer {id} of type {ptype}")]
    InvalidIdentity { id: PeerId, ptype: String },

    // Local errors
    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    #[error("Configuration error: {message}")]
    Config { message: String },
}

/// Result type alias for ricart operations.
pub type Result<T> = std::result::Result<T, OrbError>;

impl From<std::io::Error> for OrbError {
    fn from(err: std::io::Error) -> Self {
        OrbError::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for OrbError {
    fn from(err: serde_json::Error) -> Self {
        OrbError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<RemoteFault> for OrbError {
    fn from(fault: RemoteFault) -> Self {
        OrbError::Remote {
            name: fault.name,
            args: fault.args,
        }
    }
}

impl OrbError {
    /// Create a protocol error.
    pub fn protocol(message: impl Into<String>) -> Self {
        OrbError::Protocol {
            message: message.into(),
        }
    }

    /// Create an error for a request whose response never arrived.
    pub fn response_lost(addr: impl ToString, err: std::io::Error) -> Self {
        OrbError::ResponseLost {
            addr: addr.to_string(),
            message: err.to_string(),
            source: Some(err),
        }
    }

    /// Create a communication error for the given remote address.
    pub fn communication(addr: impl ToString, err: std::io::Error) -> Self {
        OrbError::Communication {
            addr: addr.to_string(),
            message: err.to_string(),
            source: Some(err),
        }
    }

    /// Wire name of this error, as seen by the remote caller.
    ///
    /// Remote errors keep the name they arrived with so that a relayed
    /// failure is reported under its original class.
    pub fn wire_name(&self) -> &str {
        match self {
            OrbError::Protocol { .. } => "ProtocolError",
            OrbError::Remote { name, .. } => name,
            OrbError::InvalidArguments { .. } => "TypeError",
            OrbError::Communication { .. } | OrbError::ResponseLost { .. } => "CommunicationError",
            OrbError::AddressResolution { .. } => "AddressResolutionError",
            OrbError::LockBusy => "LockBusy",
            OrbError::LockNotHeld => "LockNotHeld",
            OrbError::LockClosed => "LockClosed",
            OrbError::UnknownPeer(_) => "UnknownPeer",
            OrbError::NotRegistered => "NotRegistered",
            OrbError::InvalidIdentity { .. } => "InvalidIdentity",
            OrbError::Io { .. } => "IOError",
            OrbError::Json { .. } => "ValueError",
            OrbError::Config { .. } => "ConfigError",
        }
    }

    /// Convert into the fault carried by an error response.
    pub fn to_fault(&self) -> RemoteFault {
        match self {
            OrbError::Remote { name, args } => RemoteFault::new(name.clone(), args.clone()),
            other => RemoteFault::new(other.wire_name(), vec![Value::String(other.to_string())]),
        }
    }

    /// Whether the remote end could not be reached.
    ///
    /// Only failures before the request was fully written count: the remote
    /// never saw it. Used by the lock to decide that a peer is gone.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, OrbError::Communication { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = OrbError::UnknownPeer(7);
        assert_eq!(err.to_string(), "Unknown peer: 7");
    }

    #[test]
    fn test_remote_error_keeps_its_name() {
        let err = OrbError::Remote {
            name: "AttributeError".into(),
            args: vec![Value::from("no method")],
        };
        let fault = err.to_fault();
        assert_eq!(fault.name, "AttributeError");
        assert_eq!(fault.args, vec![Value::from("no method")]);
    }

    #[test]
    fn test_local_error_fault_name() {
        let fault = OrbError::LockNotHeld.to_fault();
        assert_eq!(fault.name, "LockNotHeld");
        assert_eq!(fault.args.len(), 1);
    }

    #[test]
    fn test_unreachable_errors() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        assert!(OrbError::communication("127.0.0.1:1", io).is_unreachable());
        assert!(!OrbError::protocol("bad").is_unreachable());

        let io = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "closed");
        let lost = OrbError::response_lost("127.0.0.1:1", io);
        assert!(!lost.is_unreachable());
        assert_eq!(lost.wire_name(), "CommunicationError");
    }
}
