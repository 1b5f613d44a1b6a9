//! Error types for the pure sync logic.

use tessel_sync_types::{DataType, ErrorKind};
use thiserror::Error;

/// A query references something the schema dictionary does not know,
/// or is malformed. Carries the dotted path of the offending node.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    /// Namespace does not exist.
    #[error("unknown namespace `{path}`")]
    UnknownNamespace {
        /// Offending path.
        path: String,
    },

    /// Attribute does not exist on the namespace.
    #[error("unknown attribute `{path}`")]
    UnknownAttribute {
        /// Offending path.
        path: String,
    },

    /// Link label does not resolve to a forward or reverse ref.
    #[error("unknown link `{path}`")]
    UnknownLink {
        /// Offending path.
        path: String,
    },

    /// The `$` block or where clause is malformed.
    #[error("invalid query at `{path}`: {reason}")]
    InvalidQuery {
        /// Offending path.
        path: String,
        /// What is wrong.
        reason: String,
    },

    /// A pagination cursor could not be decoded or does not match the order.
    #[error("invalid cursor at `{path}`: {reason}")]
    InvalidCursor {
        /// Offending path.
        path: String,
        /// What is wrong.
        reason: String,
    },
}

impl SchemaError {
    /// Dotted path of the node that failed.
    pub fn path(&self) -> &str {
        match self {
            SchemaError::UnknownNamespace { path }
            | SchemaError::UnknownAttribute { path }
            | SchemaError::UnknownLink { path }
            | SchemaError::InvalidQuery { path, .. }
            | SchemaError::InvalidCursor { path, .. } => path,
        }
    }

    pub(crate) fn invalid(path: &str, reason: impl Into<String>) -> Self {
        SchemaError::InvalidQuery {
            path: path.to_string(),
            reason: reason.into(),
        }
    }
}

/// A transaction was rejected locally, before any round trip.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// Namespace is not in the schema and the schema is strict.
    #[error("unknown namespace `{etype}`")]
    UnknownNamespace {
        /// Namespace.
        etype: String,
    },

    /// Attribute is not in the schema and the schema is strict.
    #[error("unknown attribute `{etype}.{label}`")]
    UnknownAttribute {
        /// Namespace.
        etype: String,
        /// Label.
        label: String,
    },

    /// Link label does not resolve to a ref attribute.
    #[error("unknown link `{etype}.{label}`")]
    UnknownLink {
        /// Namespace.
        etype: String,
        /// Label.
        label: String,
    },

    /// A link target is not a valid entity id.
    #[error("invalid link target for `{etype}.{label}`: {value}")]
    InvalidLinkTarget {
        /// Namespace.
        etype: String,
        /// Label.
        label: String,
        /// Offending value.
        value: String,
    },

    /// A ref attribute was written with update/merge instead of link.
    #[error("`{etype}.{label}` is a link; use link/unlink")]
    LinkAttribute {
        /// Namespace.
        etype: String,
        /// Label.
        label: String,
    },

    /// Value does not match or coerce to the checked data type.
    #[error("`{etype}.{label}` expects {expected:?}, got {value}")]
    TypeMismatch {
        /// Namespace.
        etype: String,
        /// Label.
        label: String,
        /// Declared type.
        expected: DataType,
        /// Offending value.
        value: String,
    },

    /// Required attribute set to null or missing on create.
    #[error("`{etype}.{label}` is required")]
    Required {
        /// Namespace.
        etype: String,
        /// Label.
        label: String,
    },

    /// Another entity already holds the value of a unique attribute.
    #[error("`{etype}.{label}` must be unique; {value} is taken")]
    NotUnique {
        /// Namespace.
        etype: String,
        /// Label.
        label: String,
        /// Offending value.
        value: String,
    },

    /// A chunk argument has the wrong shape.
    #[error("invalid argument for `{etype}`: {reason}")]
    InvalidArgument {
        /// Namespace.
        etype: String,
        /// What is wrong.
        reason: String,
    },

    /// The pending-mutation log is full.
    #[error("mutation queue full (capacity: {capacity})")]
    QueueFull {
        /// Capacity of the log.
        capacity: usize,
    },
}

/// Category of a server-confirmed rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RejectionKind {
    /// Permission rules denied the transaction.
    Permission,
    /// A unique attribute already held a value.
    Uniqueness,
    /// A referenced entity does not exist.
    NotFound,
    /// Server-side validation failed.
    Validation,
    /// Anything else.
    Other,
}

impl From<ErrorKind> for RejectionKind {
    fn from(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::PermissionDenied | ErrorKind::Unauthorized => RejectionKind::Permission,
            ErrorKind::RecordNotUnique => RejectionKind::Uniqueness,
            ErrorKind::RecordNotFound => RejectionKind::NotFound,
            ErrorKind::ValidationFailed | ErrorKind::InvalidQuery => RejectionKind::Validation,
            ErrorKind::Unknown => RejectionKind::Other,
        }
    }
}

/// Outcome of a failed transaction.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MutationError {
    /// Rejected locally before sending.
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// Rejected by the server.
    #[error("rejected ({kind:?}): {message}")]
    Rejected {
        /// Category.
        kind: RejectionKind,
        /// Server message.
        message: String,
    },

    /// The client shut down before the mutation resolved.
    #[error("client closed before the mutation resolved")]
    Cancelled,
}

/// Why a query subscription has no result.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueryError {
    /// The query does not match the schema.
    #[error(transparent)]
    Schema(#[from] SchemaError),

    /// The server refused the query.
    #[error("query rejected ({kind:?}): {message}")]
    Server {
        /// Category.
        kind: RejectionKind,
        /// Server message.
        message: String,
    },
}
