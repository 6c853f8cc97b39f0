use thiserror::Error;

use crate::arena::FieldId;
use crate::field::Access;
use crate::node::NodeId;
use crate::value::TypeTag;

/// An operation violated a field's access-type/owner rules.
/// These indicate wiring mistakes and are always surfaced to the caller.
#[derive(Debug, Error)]
pub enum AccessError {
    #[error("cannot route from {access} field {from} into {to} from outside its owner")]
    RouteOut {
        access: Access,
        from: String,
        to: String,
    },
    #[error("cannot route {from} into {access} field {to} from outside its owner")]
    RouteIn {
        access: Access,
        from: String,
        to: String,
    },
    #[error("cannot write {access} field {field} from outside its owner")]
    Write { access: Access, field: String },
    #[error("cannot write {access} field {field} after its owner is initialized")]
    WriteAfterInit { access: Access, field: String },
    #[error("cannot read {access} field {field} from outside its owner")]
    Read { access: Access, field: String },
}

#[derive(Debug, Error)]
pub enum GraphError {
    #[error(transparent)]
    Access(#[from] AccessError),

    #[error("type mismatch: cannot route {from} ({from_tag}) into {to} ({to_tag})")]
    TypeMismatch {
        from: String,
        from_tag: TypeTag,
        to: String,
        to_tag: TypeTag,
    },

    #[error("type mismatch: field {field} holds {expected}, got {found}")]
    ValueType {
        field: String,
        expected: TypeTag,
        found: TypeTag,
    },

    #[error("stale field handle {0}")]
    Stale(FieldId),

    #[error("route index {index} out of bounds for {field} with {len} inputs")]
    BadRouteIndex {
        field: String,
        index: usize,
        len: usize,
    },

    #[error("field {0} is not a draw cache")]
    NotCache(String),

    #[error("unknown node {0}")]
    UnknownNode(NodeId),

    #[error("node {node} has no field named {name:?}")]
    UnknownField { node: String, name: String },
}

/// The render backend could not compile a draw list.
/// Recovered locally by rendering directly; never crosses a tick boundary.
#[derive(Debug, Error)]
#[error("draw list build failed: {reason}")]
pub struct CacheBuildFailure {
    pub reason: String,
}

impl CacheBuildFailure {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}
