//! Bus Error Types
//!
//! Error taxonomy shared by drivers, buses, collectors and the flow-control
//! consumers. Errors are classified so that callers can decide whether to
//! swallow (benign races, transient exhaustion) or escalate (ordering and
//! disposal violations, configuration faults).

use thiserror::Error;

/// Main bus error type
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    /// No registered driver recognised the endpoint name
    #[error("Unresolvable endpoint: {name}")]
    UnresolvableEndPoint { name: String },

    /// The endpoint name matched a driver but was malformed
    #[error("Invalid endpoint '{name}': {reason}")]
    InvalidEndPoint { name: String, reason: String },

    /// No driver supports the endpoint
    #[error("Unsupported endpoint: {endpoint}")]
    UnsupportedEndPoint { endpoint: String },

    /// The driver produced a bus of the wrong capability
    #[error("Endpoint {endpoint} does not support a {kind} bus")]
    UnsupportedBusKind { endpoint: String, kind: &'static str },

    /// Two drivers registered under one name
    #[error("Duplicate driver registration: {name}")]
    DuplicateDriver { name: String },

    /// A live bus is already bound to the local endpoint
    #[error("Endpoint already bound: {endpoint}")]
    AddressInUse { endpoint: String },

    /// The peer is not (or no longer) connected
    #[error("Unknown peer {peer}: {message}")]
    UnknownPeer { peer: String, message: String },

    /// The bus is not open
    #[error("Bus closed: {endpoint}")]
    Closed { endpoint: String },

    /// Backlog transitions were observed out of order
    #[error("Backlog ordering violation: {message}")]
    BacklogOrdering { message: String },

    /// More completions than outstanding operations, or similar accounting faults
    #[error("Disposal violation: {message}")]
    Disposal { message: String },

    /// Operation invoked in a state that does not permit it
    #[error("Illegal state: {message}")]
    IllegalState { message: String },

    /// Buffer or credit exhaustion
    #[error("Resource exhausted: {resource}: {message}")]
    ResourceExhausted { resource: String, message: String },

    /// Malformed data on the wire or in a memory region
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        field: Option<String>,
    },

    /// A blocking wait was cancelled
    #[error("Interrupted: {operation}")]
    Interrupted { operation: String },
}

/// Result type alias for bus operations
pub type Result<T> = std::result::Result<T, BusError>;

impl BusError {
    /// Create an unresolvable endpoint error
    pub fn unresolvable(name: impl Into<String>) -> Self {
        Self::UnresolvableEndPoint { name: name.into() }
    }

    /// Create an invalid endpoint error
    pub fn invalid_endpoint(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidEndPoint {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Create an unsupported endpoint error
    pub fn unsupported(endpoint: impl ToString) -> Self {
        Self::UnsupportedEndPoint {
            endpoint: endpoint.to_string(),
        }
    }

    /// Create an unknown peer error
    pub fn unknown_peer(peer: impl ToString, message: impl Into<String>) -> Self {
        Self::UnknownPeer {
            peer: peer.to_string(),
            message: message.into(),
        }
    }

    /// Create a closed bus error
    pub fn closed(endpoint: impl ToString) -> Self {
        Self::Closed {
            endpoint: endpoint.to_string(),
        }
    }

    /// Create a backlog ordering error
    pub fn ordering(message: impl Into<String>) -> Self {
        Self::BacklogOrdering {
            message: message.into(),
        }
    }

    /// Create a disposal violation
    pub fn disposal(message: impl Into<String>) -> Self {
        Self::Disposal {
            message: message.into(),
        }
    }

    /// Create an illegal state error
    pub fn illegal_state(message: impl Into<String>) -> Self {
        Self::IllegalState {
            message: message.into(),
        }
    }

    /// Create a resource exhausted error
    pub fn resource_exhausted(resource: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ResourceExhausted {
            resource: resource.into(),
            message: message.into(),
        }
    }

    /// Create a protocol error
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration(message: impl Into<String>, field: Option<&str>) -> Self {
        Self::Configuration {
            message: message.into(),
            field: field.map(|s| s.to_string()),
        }
    }

    /// Create an interrupted error
    pub fn interrupted(operation: impl Into<String>) -> Self {
        Self::Interrupted {
            operation: operation.into(),
        }
    }

    /// Logic bugs in event ordering or correlation; never retried
    pub fn is_ordering_violation(&self) -> bool {
        matches!(
            self,
            BusError::BacklogOrdering { .. } | BusError::Disposal { .. }
        )
    }

    /// A send raced with a concurrent release or close of the peer
    pub fn is_benign_race(&self) -> bool {
        matches!(self, BusError::UnknownPeer { .. } | BusError::Closed { .. })
    }

    /// Conditions that are swallowed locally and counted
    pub fn is_recoverable(&self) -> bool {
        match self {
            BusError::ResourceExhausted { .. } => true,
            BusError::Interrupted { .. } => true,
            other => other.is_benign_race(),
        }
    }

    /// Setup-time faults that fail fast
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            BusError::UnresolvableEndPoint { .. }
                | BusError::InvalidEndPoint { .. }
                | BusError::UnsupportedEndPoint { .. }
                | BusError::UnsupportedBusKind { .. }
                | BusError::DuplicateDriver { .. }
                | BusError::AddressInUse { .. }
                | BusError::Configuration { .. }
        )
    }

    /// Get error category for metrics
    pub fn category(&self) -> &'static str {
        match self {
            BusError::UnresolvableEndPoint { .. } => "unresolvable_endpoint",
            BusError::InvalidEndPoint { .. } => "invalid_endpoint",
            BusError::UnsupportedEndPoint { .. } => "unsupported_endpoint",
            BusError::UnsupportedBusKind { .. } => "unsupported_bus_kind",
            BusError::DuplicateDriver { .. } => "duplicate_driver",
            BusError::AddressInUse { .. } => "address_in_use",
            BusError::UnknownPeer { .. } => "unknown_peer",
            BusError::Closed { .. } => "closed",
            BusError::BacklogOrdering { .. } => "backlog_ordering",
            BusError::Disposal { .. } => "disposal",
            BusError::IllegalState { .. } => "illegal_state",
            BusError::ResourceExhausted { .. } => "resource_exhausted",
            BusError::Protocol { .. } => "protocol",
            BusError::Configuration { .. } => "configuration",
            BusError::Interrupted { .. } => "interrupted",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(BusError::unknown_peer("lb://a", "released").is_benign_race());
        assert!(BusError::unknown_peer("lb://a", "released").is_recoverable());
        assert!(BusError::ordering("double excessive").is_ordering_violation());
        assert!(!BusError::ordering("double excessive").is_recoverable());
        assert!(BusError::unresolvable("bogus").is_configuration());
        assert!(BusError::resource_exhausted("buffers", "pool empty").is_recoverable());
    }

    #[test]
    fn test_display_carries_context() {
        let err = BusError::configuration("must be positive", Some("segment_size"));
        assert_eq!(err.to_string(), "Configuration error: must be positive");
        assert_eq!(err.category(), "configuration");
    }
}
