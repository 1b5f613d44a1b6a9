//! Triples and transaction steps.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{AttrId, AttrPatch, Attribute, EntityId};

/// A single fact: `(entity, attribute, value, created_at)`.
///
/// On the wire a triple is the array `[e, a, v, created_at]`. For link
/// attributes `v` is the linked entity id as a string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "TripleRepr", into = "TripleRepr")]
pub struct Triple {
    /// Entity the fact belongs to.
    pub e: EntityId,
    /// Attribute of the fact.
    pub a: AttrId,
    /// Value of the fact.
    pub v: Value,
    /// Creation stamp. Server-assigned and monotonically increasing for
    /// confirmed data; local wall-clock millis for optimistic data.
    pub created_at: u64,
}

#[derive(Serialize, Deserialize)]
struct TripleRepr(EntityId, AttrId, Value, #[serde(default)] u64);

impl From<TripleRepr> for Triple {
    fn from(repr: TripleRepr) -> Self {
        Self {
            e: repr.0,
            a: repr.1,
            v: repr.2,
            created_at: repr.3,
        }
    }
}

impl From<Triple> for TripleRepr {
    fn from(t: Triple) -> Self {
        TripleRepr(t.e, t.a, t.v, t.created_at)
    }
}

impl Triple {
    /// Create a triple.
    pub fn new(e: EntityId, a: AttrId, v: Value, created_at: u64) -> Self {
        Self { e, a, v, created_at }
    }

    /// The linked entity id if the value is a valid id string.
    pub fn ref_target(&self) -> Option<EntityId> {
        self.v.as_str().and_then(|s| EntityId::parse(s).ok())
    }
}

/// One step of a transaction.
///
/// Steps are applied in order; a transaction is atomic on the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum TxStep {
    /// Assert a value. On cardinality-one attributes it replaces the old one.
    AddTriple {
        /// Entity.
        e: EntityId,
        /// Attribute.
        a: AttrId,
        /// Value.
        v: Value,
    },
    /// Retract a value.
    RetractTriple {
        /// Entity.
        e: EntityId,
        /// Attribute.
        a: AttrId,
        /// Value.
        v: Value,
    },
    /// Deep-merge a JSON patch into the current value.
    DeepMergeTriple {
        /// Entity.
        e: EntityId,
        /// Attribute.
        a: AttrId,
        /// Patch. `{"$undefined": true}` leaves remove keys.
        v: Value,
    },
    /// Delete an entity, its triples, links pointing at it, and cascades.
    DeleteEntity {
        /// Entity.
        e: EntityId,
        /// Namespace of the entity.
        etype: String,
    },
    /// Add an attribute to the schema dictionary.
    AddAttr {
        /// New attribute.
        attr: Attribute,
    },
    /// Remove an attribute and all of its triples.
    DeleteAttr {
        /// Attribute to remove.
        id: AttrId,
    },
    /// Partially update an attribute.
    UpdateAttr {
        /// Patch.
        attr: AttrPatch,
    },
}

impl TxStep {
    /// Whether this step changes the schema dictionary.
    pub fn is_schema_step(&self) -> bool {
        matches!(
            self,
            TxStep::AddAttr { .. } | TxStep::DeleteAttr { .. } | TxStep::UpdateAttr { .. }
        )
    }
}
