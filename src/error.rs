use std::fmt;

use crate::dag::NodeId;

/// Every fallible operation in the lowering pipeline reports through this type. Each
/// variant names the pass that detected the problem and the node ids involved so a
/// caller can point a debugger (or a human) at the right place in the right IR.
#[derive(Debug, Clone, PartialEq)]
pub enum LowerError {
    /// A DAG precondition was violated: wrong parent count on removal, a cycle,
    /// an id referenced that doesn't exist, and the like.
    Structural {
        /// Name of the pass (or DAG operation) that detected the violation.
        pass: &'static str,
        /// Node ids implicated in the violation.
        nodes: Vec<NodeId>,
        /// Human-readable detail.
        message: String,
    },

    /// Two operands that must share a layout (e.g. the inputs to `AddCC`) don't.
    LayoutMismatch {
        /// Name of the pass that detected the mismatch.
        pass: &'static str,
        /// Node ids implicated.
        nodes: Vec<NodeId>,
        /// Human-readable detail.
        message: String,
    },

    /// A node's level would fall below the minimum of 1 and no bootstrap can
    /// recover it.
    LevelUnderflow {
        /// Name of the pass that detected the underflow.
        pass: &'static str,
        /// Node ids implicated.
        nodes: Vec<NodeId>,
        /// Human-readable detail.
        message: String,
    },

    /// Deserialisation encountered a payload type tag it doesn't recognise.
    UnknownTypeName {
        /// Name of the pass (deserialiser) that detected this.
        pass: &'static str,
        /// The unrecognised type tag.
        name: String,
    },

    /// A numeric precondition failed at construction time (chunk size not a
    /// power of two, log chunk size out of bounds, stride not a power of two, ...).
    NumericPrecondition {
        /// Short description of what failed to validate.
        what: &'static str,
        /// Human-readable detail.
        message: String,
    },
}

impl fmt::Display for LowerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LowerError::Structural {
                pass,
                nodes,
                message,
            } => write!(
                f,
                "structural violation in pass `{pass}` at nodes {nodes:?}: {message}"
            ),
            LowerError::LayoutMismatch {
                pass,
                nodes,
                message,
            } => write!(
                f,
                "layout mismatch in pass `{pass}` at nodes {nodes:?}: {message}"
            ),
            LowerError::LevelUnderflow {
                pass,
                nodes,
                message,
            } => write!(
                f,
                "level underflow in pass `{pass}` at nodes {nodes:?}: {message}"
            ),
            LowerError::UnknownTypeName { pass, name } => {
                write!(f, "unknown type name `{name}` while deserialising in `{pass}`")
            }
            LowerError::NumericPrecondition { what, message } => {
                write!(f, "numeric precondition `{what}` failed: {message}")
            }
        }
    }
}

impl std::error::Error for LowerError {}

impl LowerError {
    /// Build a [`LowerError::Structural`] for the given pass and nodes.
    pub fn structural(pass: &'static str, nodes: impl IntoIterator<Item = NodeId>, message: impl Into<String>) -> Self {
        LowerError::Structural {
            pass,
            nodes: nodes.into_iter().collect(),
            message: message.into(),
        }
    }

    /// Build a [`LowerError::LayoutMismatch`] for the given pass and nodes.
    pub fn layout_mismatch(
        pass: &'static str,
        nodes: impl IntoIterator<Item = NodeId>,
        message: impl Into<String>,
    ) -> Self {
        LowerError::LayoutMismatch {
            pass,
            nodes: nodes.into_iter().collect(),
            message: message.into(),
        }
    }

    /// Build a [`LowerError::LevelUnderflow`] for the given pass and nodes.
    pub fn level_underflow(
        pass: &'static str,
        nodes: impl IntoIterator<Item = NodeId>,
        message: impl Into<String>,
    ) -> Self {
        LowerError::LevelUnderflow {
            pass,
            nodes: nodes.into_iter().collect(),
            message: message.into(),
        }
    }

    /// Build a [`LowerError::NumericPrecondition`].
    pub fn numeric(what: &'static str, message: impl Into<String>) -> Self {
        LowerError::NumericPrecondition {
            what,
            message: message.into(),
        }
    }
}

/// Wrapper around [`Result`](std::result::Result) with this crate's error type.
pub type Result<T> = std::result::Result<T, LowerError>;
