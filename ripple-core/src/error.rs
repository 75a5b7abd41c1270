//! Error types for the reactive engine.
//!
//! Every fallible operation in the crate returns [`Result`]. Errors are
//! `Clone` because the same failure (a broken derived computation, say) may
//! have to be handed to several readers that pulled it in the same commit.

use std::sync::Arc;

use crate::graph::NodeId;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the reactive engine.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// A node was read while it was in the middle of computing itself.
    #[error("cycle detected: node {node} was read while it was being computed")]
    Cycle {
        /// The node found in the `Updating` state.
        node: NodeId,
    },

    /// A node was read or subscribed to after it was disposed.
    #[error("node {node} has been disposed")]
    Disposed {
        /// The disposed node.
        node: NodeId,
    },

    /// A write was attempted from inside a derived computation.
    #[error("node {target} was written while derived node {reader} was computing")]
    WriteDuringCompute {
        /// The node being written.
        target: NodeId,
        /// The derived node whose computation issued the write.
        reader: NodeId,
    },

    /// A handle from one runtime was used with a reader or transaction of another.
    #[error("node {node} belongs to a different runtime")]
    ForeignRuntime {
        /// The offending node.
        node: NodeId,
    },

    /// The node's last handle was dropped and it no longer exists in the graph.
    #[error("node {node} no longer exists")]
    Dropped {
        /// The missing node.
        node: NodeId,
    },

    /// Reactions kept writing values that re-triggered other reactions.
    #[error("reactions were still re-triggering after {rounds} commit rounds")]
    RunawayReactions {
        /// Number of rounds executed before giving up.
        rounds: usize,
    },

    /// A reaction body panicked. The panic was caught at the reaction boundary.
    #[error("reaction {node} panicked: {message}")]
    ReactionPanicked {
        /// The reaction that panicked.
        node: NodeId,
        /// The panic payload, if it was a string.
        message: String,
    },

    /// A user computation failed.
    #[error("computation failed: {0}")]
    Compute(Arc<dyn std::error::Error + Send + Sync>),
}

impl Error {
    /// Wrap an arbitrary error raised by a derived function or reaction body.
    pub fn compute<E>(err: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Error::Compute(Arc::from(err.into()))
    }

    /// Shorthand for a [`Error::Compute`] carrying a plain message.
    pub fn msg(message: impl Into<String>) -> Self {
        Self::compute(message.into())
    }

    /// True for errors that indicate a lifetime bug in the caller.
    pub fn is_lifetime_error(&self) -> bool {
        matches!(self, Error::Disposed { .. } | Error::Dropped { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compute_wraps_messages() {
        let err = Error::msg("division by zero");
        assert_eq!(err.to_string(), "computation failed: division by zero");
    }

    #[test]
    fn compute_wraps_std_errors() {
        let parse = "x".parse::<i32>().unwrap_err();
        let err = Error::compute(parse);
        assert!(matches!(err, Error::Compute(_)));
        assert!(err.to_string().contains("invalid digit"));
    }

    #[test]
    fn lifetime_errors_are_classified() {
        let node = NodeId::from(7);
        assert!(Error::Disposed { node }.is_lifetime_error());
        assert!(Error::Dropped { node }.is_lifetime_error());
        assert!(!Error::Cycle { node }.is_lifetime_error());
    }

    #[test]
    fn errors_are_cloneable() {
        let err = Error::msg("boom");
        let copy = err.clone();
        assert_eq!(err.to_string(), copy.to_string());
    }
}
