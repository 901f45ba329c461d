//! Error types for the mesh.
//!
//! Two families of errors exist and they never mix:
//!
//! - [`GeomError`]: structural, access and event-queue failures. Returned
//!   synchronously from topology operations; a failed operation leaves the
//!   graph unchanged.
//! - [`BioError`]: per-request I/O codes. Only ever reported through
//!   [`deliver`](crate::io::deliver), and also used as the error value a
//!   provider carries once it has failed.

use thiserror::Error;

use crate::topology::{ClassId, ConsumerId, NodeId, ProviderId};

/// I/O error code carried by a completed [`Bio`](crate::Bio) or a failed provider.
///
/// Modelled on the small set of errno values block stacks actually use, so the
/// code survives a trip through a control request or a dump unchanged.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BioError {
    /// Generic media error (`EIO`).
    #[error("input/output error")]
    Io,
    /// The consumer is not attached, or the provider went away (`ENXIO`).
    #[error("device not configured")]
    NoDevice,
    /// The consumer lacks the access rights the command needs (`EPERM`).
    #[error("operation not permitted")]
    NotPermitted,
    /// The resource is in use (`EBUSY`).
    #[error("device busy")]
    Busy,
    /// Misaligned offset/length or offset beyond the media (`EINVAL`).
    #[error("invalid argument")]
    InvalidArgument,
    /// The node does not implement the command or attribute (`EOPNOTSUPP`).
    #[error("operation not supported")]
    NotSupported,
    /// No space left on the device (`ENOSPC`).
    #[error("no space left on device")]
    NoSpace,
}

impl BioError {
    /// Returns the conventional errno value for this code.
    pub const fn errno(self) -> i32 {
        match self {
            Self::NotPermitted => 1,
            Self::Io => 5,
            Self::NoDevice => 6,
            Self::Busy => 16,
            Self::InvalidArgument => 22,
            Self::NoSpace => 28,
            Self::NotSupported => 45,
        }
    }

    /// Maps an errno value back to a code. Unknown values map to [`BioError::Io`].
    pub const fn from_errno(errno: i32) -> Self {
        match errno {
            1 => Self::NotPermitted,
            6 => Self::NoDevice,
            16 => Self::Busy,
            22 => Self::InvalidArgument,
            28 => Self::NoSpace,
            45 => Self::NotSupported,
            _ => Self::Io,
        }
    }
}

/// Errors returned synchronously by topology, access and event operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GeomError {
    /// The class handle does not refer to a registered class.
    #[error("class {0} not found")]
    ClassNotFound(ClassId),
    /// The node handle does not refer to a live node.
    #[error("node {0} not found")]
    NodeNotFound(NodeId),
    /// The provider handle does not refer to a live provider.
    #[error("provider {0} not found")]
    ProviderNotFound(ProviderId),
    /// The consumer handle does not refer to a live consumer.
    #[error("consumer {0} not found")]
    ConsumerNotFound(ConsumerId),
    /// A class, node or provider with this name already exists.
    #[error("{kind} name '{name}' already in use")]
    NameConflict {
        /// Which namespace collided ("class", "node", "provider").
        kind: &'static str,
        /// The conflicting name.
        name: String,
    },
    /// The class was built against a different framework version.
    #[error("class '{class}' has version {found:#x}, expected {expected:#x}")]
    VersionMismatch {
        /// Class name.
        class: String,
        /// Version the framework implements.
        expected: u32,
        /// Version the class declared.
        found: u32,
    },
    /// The class still owns nodes and cannot be unregistered.
    #[error("class '{class}' still owns {nodes} node(s)")]
    ClassBusy {
        /// Class name.
        class: String,
        /// Number of nodes left.
        nodes: usize,
    },
    /// Provider geometry is unusable (zero sector size, misaligned media size).
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),
    /// The consumer is already attached to a provider.
    #[error("consumer {0} is already attached")]
    AlreadyAttached(ConsumerId),
    /// The consumer is not attached to any provider.
    #[error("consumer {0} is not attached")]
    NotAttached(ConsumerId),
    /// Attaching would let a node consume (transitively) from itself.
    #[error("attaching consumer {consumer} to provider {provider} would create a cycle")]
    WouldCycle {
        /// Consumer being attached.
        consumer: ConsumerId,
        /// Target provider.
        provider: ProviderId,
    },
    /// The provider has been orphaned and accepts no new attachments.
    #[error("provider {0} is orphaned")]
    ProviderOrphaned(ProviderId),
    /// The consumer still holds access and cannot be detached.
    #[error("consumer {0} still holds access")]
    ConsumerOpen(ConsumerId),
    /// The consumer is still attached and cannot be destroyed.
    #[error("consumer {0} is still attached")]
    ConsumerAttached(ConsumerId),
    /// The provider still has consumers attached.
    #[error("provider {0} still has consumers attached")]
    ProviderBusy(ProviderId),
    /// An access change would drive a count below zero.
    #[error("access change on consumer {0} would go negative")]
    NegativeAccess(ConsumerId),
    /// An access change would overflow a count.
    #[error("access change on consumer {0} would overflow")]
    AccessOverflow(ConsumerId),
    /// An access change would break read/write versus exclusive separation.
    #[error("exclusive access conflict on provider {0}")]
    ExclusiveConflict(ProviderId),
    /// The provider carries an error and refuses new opens.
    #[error("provider failed: {0}")]
    ProviderFailed(BioError),
    /// A node's access callback refused the change.
    #[error("node {node} refused access: {reason}")]
    Vetoed {
        /// Node whose callback refused.
        node: NodeId,
        /// Reason given by the node.
        reason: BioError,
    },
    /// The operation would block on the topology lock held by this thread.
    #[error("operation would deadlock on the topology lock")]
    WouldDeadlock,
    /// The deferred event was cancelled before it ran.
    #[error("event cancelled before it ran")]
    EventCancelled,
    /// The event queue has been shut down.
    #[error("event queue is shut down")]
    QueueClosed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_round_trips_for_known_codes() {
        for err in [
            BioError::Io,
            BioError::NoDevice,
            BioError::NotPermitted,
            BioError::Busy,
            BioError::InvalidArgument,
            BioError::NotSupported,
            BioError::NoSpace,
        ] {
            assert_eq!(BioError::from_errno(err.errno()), err);
        }
    }

    #[test]
    fn unknown_errno_maps_to_io() {
        assert_eq!(BioError::from_errno(9999), BioError::Io);
    }

    #[test]
    fn name_conflict_display() {
        let err = GeomError::NameConflict {
            kind: "node",
            name: "md0".to_string(),
        };
        assert_eq!(err.to_string(), "node name 'md0' already in use");
    }

    #[test]
    fn provider_failed_wraps_bio_error() {
        let err = GeomError::ProviderFailed(BioError::Io);
        assert_eq!(err.to_string(), "provider failed: input/output error");
    }
}
