//! Error taxonomy for the dataflow core.

use thiserror::Error;

/// Convenience result type used across the crate.
pub type XflowResult<T> = Result<T, XflowError>;

/// Errors raised by parsing, operator registration and typed value access.
///
/// None of these cross the request boundary: the graph logs them and keeps
/// serving the last valid result.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum XflowError {
    /// A filter string did not match the filter grammar.
    #[error("invalid filter syntax: '{0}'")]
    FilterSyntax(String),

    /// A compute string did not match the compute grammar.
    #[error("invalid compute syntax: '{0}'")]
    ComputeSyntax(String),

    /// A mapping list or table was malformed.
    #[error("invalid mapping syntax: '{0}'")]
    MappingSyntax(String),

    /// A type name is not one of the known data types.
    #[error("unknown data type '{0}'")]
    UnknownType(String),

    /// An operator descriptor failed validation.
    #[error("invalid operator '{name}': {reason}")]
    InvalidOperator {
        /// Operator name.
        name: String,
        /// What is wrong with it.
        reason: String,
    },

    /// A value did not match the immutable type of the entry it targets.
    #[error("type mismatch: expected {expected}, got {actual}")]
    TypeMismatch {
        /// Type of the target entry.
        expected: String,
        /// Type of the supplied value.
        actual: String,
    },

    /// The entry id does not exist.
    #[error("unknown data entry {0}")]
    UnknownEntry(usize),

    /// Structural graph error.
    #[error(transparent)]
    Graph(#[from] GraphError),
}

impl XflowError {
    /// Build a [`XflowError::InvalidOperator`] value.
    pub fn invalid_operator(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidOperator {
            name: name.into(),
            reason: reason.into(),
        }
    }
}

/// Errors that can occur when editing the node tree.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphError {
    /// Node does not exist.
    #[error("node does not exist")]
    InvalidNode,
    /// The operation needs a DataNode.
    #[error("node is not a data node")]
    NotADataNode,
    /// Adding the edge would make a node its own ancestor.
    #[error("edge would create a cycle")]
    CycleDetected,
    /// A DataNode may forward a source node or aggregate children, never both.
    #[error("data node cannot have both a source node and children")]
    SourceAndChildren,
    /// The referenced child is not a child of the parent.
    #[error("node is not a child of the given parent")]
    NotAChild,
}
