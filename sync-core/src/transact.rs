//! Transaction builder.
//!
//! [`TxChunk`]s describe writes in terms of namespaces and labels; [`compile`]
//! turns them into [`TxStep`]s against the current optimistic snapshot,
//! coercing values and rejecting invalid writes before anything is queued.

use serde_json::{Map, Value};
use std::collections::HashMap;
use tessel_sync_types::{Attribute, EntityId, TxStep};

use crate::coerce::coerce_value;
use crate::error::ValidationError;
use crate::schema::{LinkDirection, Schema};
use crate::store::Store;

#[derive(Debug, Clone, PartialEq)]
enum ChunkOp {
    Create(Value),
    Update(Value),
    Merge(Value),
    Delete,
    Link(Value),
    Unlink(Value),
}

/// Writes to one entity.
///
/// ```
/// use serde_json::json;
/// use tessel_sync_core::TxChunk;
/// use tessel_sync_types::EntityId;
///
/// let goal = EntityId::new();
/// let todo = EntityId::new();
/// let chunks = vec![
///     TxChunk::new("goals", goal).create(json!({"title": "get fit"})),
///     TxChunk::new("todos", todo).update(json!({"title": "run"})).link(json!({"goal": goal.to_string()})),
/// ];
/// assert_eq!(chunks.len(), 2);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct TxChunk {
    etype: String,
    id: EntityId,
    ops: Vec<ChunkOp>,
    rule_params: Option<Value>,
}

impl TxChunk {
    /// Start a chunk for entity `id` in namespace `etype`.
    pub fn new(etype: impl Into<String>, id: EntityId) -> Self {
        Self {
            etype: etype.into(),
            id,
            ops: Vec::new(),
            rule_params: None,
        }
    }

    /// Create the entity; required attributes must be present.
    pub fn create(mut self, attrs: Value) -> Self {
        self.ops.push(ChunkOp::Create(attrs));
        self
    }

    /// Set attributes, replacing their values.
    pub fn update(mut self, attrs: Value) -> Self {
        self.ops.push(ChunkOp::Update(attrs));
        self
    }

    /// Deep-merge JSON values into attributes.
    pub fn merge(mut self, attrs: Value) -> Self {
        self.ops.push(ChunkOp::Merge(attrs));
        self
    }

    /// Delete the entity (cascading per schema).
    pub fn delete(mut self) -> Self {
        self.ops.push(ChunkOp::Delete);
        self
    }

    /// Link to other entities: `{label: id | [ids]}`.
    pub fn link(mut self, links: Value) -> Self {
        self.ops.push(ChunkOp::Link(links));
        self
    }

    /// Remove links: `{label: id | [ids]}`.
    pub fn unlink(mut self, links: Value) -> Self {
        self.ops.push(ChunkOp::Unlink(links));
        self
    }

    /// Permission rule parameters forwarded with the transaction.
    pub fn rule_params(mut self, params: Value) -> Self {
        self.rule_params = Some(params);
        self
    }

    /// Namespace of the chunk.
    pub fn etype(&self) -> &str {
        &self.etype
    }

    /// Entity id of the chunk.
    pub fn id(&self) -> EntityId {
        self.id
    }
}

/// Options for [`compile`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxOptions {
    /// Reject unknown namespaces and labels instead of creating attributes.
    pub strict_schema: bool,
}

/// Output of [`compile`].
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledTx {
    /// Steps in chunk order.
    pub steps: Vec<TxStep>,
    /// Rule parameters of all chunks, merged.
    pub rule_params: Option<Value>,
}

/// Compile chunks into tx-steps against a snapshot.
pub fn compile(
    chunks: &[TxChunk],
    store: &Store,
    opts: TxOptions,
) -> Result<CompiledTx, ValidationError> {
    let mut c = Compiler {
        schema: store.schema().clone(),
        store,
        opts,
        steps: Vec::new(),
        claimed: HashMap::new(),
    };
    let mut rule_params: Option<Map<String, Value>> = None;

    for chunk in chunks {
        c.chunk(chunk)?;
        if let Some(Value::Object(params)) = &chunk.rule_params {
            rule_params.get_or_insert_with(Map::new).extend(params.clone());
        }
    }

    Ok(CompiledTx {
        steps: c.steps,
        rule_params: rule_params.map(Value::Object),
    })
}

struct Compiler<'a> {
    schema: Schema,
    store: &'a Store,
    opts: TxOptions,
    steps: Vec<TxStep>,
    /// unique values written earlier in this transaction
    claimed: HashMap<(tessel_sync_types::AttrId, String), EntityId>,
}

impl Compiler<'_> {
    fn chunk(&mut self, chunk: &TxChunk) -> Result<(), ValidationError> {
        let etype = chunk.etype.as_str();
        if self.opts.strict_schema && !self.schema.has_namespace(etype) {
            return Err(ValidationError::UnknownNamespace {
                etype: etype.to_string(),
            });
        }

        for op in &chunk.ops {
            match op {
                ChunkOp::Create(attrs) => {
                    let attrs = object(etype, attrs)?;
                    self.check_required(etype, attrs)?;
                    self.write_attrs(chunk, attrs, false)?;
                }
                ChunkOp::Update(attrs) => {
                    let attrs = object(etype, attrs)?;
                    self.write_attrs(chunk, attrs, false)?;
                }
                ChunkOp::Merge(attrs) => {
                    let attrs = object(etype, attrs)?;
                    self.write_attrs(chunk, attrs, true)?;
                }
                ChunkOp::Delete => self.steps.push(TxStep::DeleteEntity {
                    e: chunk.id,
                    etype: etype.to_string(),
                }),
                ChunkOp::Link(links) => {
                    let links = object(etype, links)?;
                    self.id_triple(chunk)?;
                    self.links(chunk, links, true)?;
                }
                ChunkOp::Unlink(links) => {
                    let links = object(etype, links)?;
                    self.links(chunk, links, false)?;
                }
            }
        }
        Ok(())
    }

    fn check_required(&self, etype: &str, attrs: &Map<String, Value>) -> Result<(), ValidationError> {
        let missing = self.schema.attrs().find(|a| {
            a.forward_identity.etype == etype
                && a.required
                && !a.is_ref()
                && !attrs.contains_key(&a.forward_identity.label)
        });
        match missing {
            Some(a) => Err(ValidationError::Required {
                etype: etype.to_string(),
                label: a.forward_identity.label.clone(),
            }),
            None => Ok(()),
        }
    }

    /// Emit `[e, id-attr, e]`, creating the id attribute if needed.
    fn id_triple(&mut self, chunk: &TxChunk) -> Result<(), ValidationError> {
        let id_attr = match self.schema.id_attr(&chunk.etype) {
            Some(attr) => attr.clone(),
            None => self.add_attr(Attribute::id_attr(chunk.etype.clone())),
        };
        let v = Value::String(chunk.id.to_string());
        self.check_unique(&id_attr, chunk.id, &v)?;
        self.steps.push(TxStep::AddTriple {
            e: chunk.id,
            a: id_attr.id,
            v,
        });
        Ok(())
    }

    fn write_attrs(
        &mut self,
        chunk: &TxChunk,
        attrs: &Map<String, Value>,
        merge: bool,
    ) -> Result<(), ValidationError> {
        let etype = chunk.etype.as_str();
        self.id_triple(chunk)?;

        for (label, value) in attrs {
            if label == "id" {
                continue;
            }
            let attr = self.blob_attr(etype, label)?;
            if merge {
                if value.is_null() && attr.required {
                    return Err(ValidationError::Required {
                        etype: etype.to_string(),
                        label: label.clone(),
                    });
                }
                self.steps.push(TxStep::DeepMergeTriple {
                    e: chunk.id,
                    a: attr.id,
                    v: value.clone(),
                });
                continue;
            }

            let v = coerce_value(&attr, value.clone())?;
            if attr.unique && !v.is_null() {
                self.check_unique(&attr, chunk.id, &v)?;
            }
            self.steps.push(TxStep::AddTriple {
                e: chunk.id,
                a: attr.id,
                v,
            });
        }
        Ok(())
    }

    fn blob_attr(&mut self, etype: &str, label: &str) -> Result<Attribute, ValidationError> {
        if let Some(attr) = self.schema.forward(etype, label) {
            if attr.is_ref() {
                return Err(ValidationError::LinkAttribute {
                    etype: etype.to_string(),
                    label: label.to_string(),
                });
            }
            return Ok(attr.clone());
        }
        if self.schema.reverse(etype, label).is_some() {
            return Err(ValidationError::LinkAttribute {
                etype: etype.to_string(),
                label: label.to_string(),
            });
        }
        if self.opts.strict_schema {
            return Err(ValidationError::UnknownAttribute {
                etype: etype.to_string(),
                label: label.to_string(),
            });
        }
        Ok(self.add_attr(Attribute::blob(etype, label)))
    }

    fn add_attr(&mut self, attr: Attribute) -> Attribute {
        self.schema = self.schema.with_attr(attr.clone());
        self.steps.push(TxStep::AddAttr { attr: attr.clone() });
        attr
    }

    fn check_unique(
        &mut self,
        attr: &Attribute,
        e: EntityId,
        v: &Value,
    ) -> Result<(), ValidationError> {
        let key = (attr.id, v.to_string());
        let holder = self
            .claimed
            .get(&key)
            .copied()
            .or_else(|| self.store.find_unique(&attr.id, v));
        if let Some(holder) = holder {
            if holder != e {
                return Err(ValidationError::NotUnique {
                    etype: attr.forward_identity.etype.clone(),
                    label: attr.forward_identity.label.clone(),
                    value: v.to_string(),
                });
            }
        }
        self.claimed.insert(key, e);
        Ok(())
    }

    fn links(
        &mut self,
        chunk: &TxChunk,
        links: &Map<String, Value>,
        add: bool,
    ) -> Result<(), ValidationError> {
        let etype = chunk.etype.as_str();
        for (label, targets) in links {
            let (attr_id, direction) = match self.schema.link(etype, label) {
                Some((attr, direction, _)) => (attr.id, direction),
                None => {
                    return Err(ValidationError::UnknownLink {
                        etype: etype.to_string(),
                        label: label.clone(),
                    })
                }
            };

            let targets: Vec<&Value> = match targets {
                Value::Array(items) => items.iter().collect(),
                single => vec![single],
            };
            for target in targets {
                let target_id = target
                    .as_str()
                    .and_then(|s| EntityId::parse(s).ok())
                    .ok_or_else(|| ValidationError::InvalidLinkTarget {
                        etype: etype.to_string(),
                        label: label.clone(),
                        value: target.to_string(),
                    })?;
                let (e, v) = match direction {
                    LinkDirection::Forward => (chunk.id, target_id),
                    LinkDirection::Reverse => (target_id, chunk.id),
                };
                let v = Value::String(v.to_string());
                self.steps.push(if add {
                    TxStep::AddTriple { e, a: attr_id, v }
                } else {
                    TxStep::RetractTriple { e, a: attr_id, v }
                });
            }
        }
        Ok(())
    }
}

fn object<'v>(etype: &str, value: &'v Value) -> Result<&'v Map<String, Value>, ValidationError> {
    value
        .as_object()
        .ok_or_else(|| ValidationError::InvalidArgument {
            etype: etype.to_string(),
            reason: format!("expected an object, got {value}"),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tessel_sync_types::{Cardinality, DataType, Identity};

    fn schema() -> Schema {
        Schema::from_attrs(vec![
            Attribute::id_attr("goals"),
            Attribute::blob("goals", "title").with_required(),
            Attribute::blob("goals", "due").with_data_type(DataType::Date),
            Attribute::id_attr("users"),
            Attribute::blob("users", "email").with_unique(),
            Attribute::id_attr("todos"),
            Attribute::link(
                Identity::new("todos", "goal"),
                Identity::new("goals", "todos"),
                Cardinality::One,
            ),
        ])
    }

    fn store() -> Store {
        Store::new(schema())
    }

    fn lax() -> TxOptions {
        TxOptions::default()
    }

    fn strict() -> TxOptions {
        TxOptions {
            strict_schema: true,
        }
    }

    // ===========================================
    // Attribute writes
    // ===========================================

    #[test]
    fn create_emits_id_triple_and_values() {
        let s = store();
        let e = EntityId::new();
        let tx = compile(
            &[TxChunk::new("goals", e).create(json!({"title": "a"}))],
            &s,
            lax(),
        )
        .unwrap();
        let next = s.apply(&tx.steps, 1);
        let title = s.schema().forward("goals", "title").unwrap().id;
        let id = s.schema().id_attr("goals").unwrap().id;
        assert_eq!(next.value(&e, &title), Some(&json!("a")));
        assert_eq!(next.value(&e, &id), Some(&json!(e.to_string())));
    }

    #[test]
    fn unknown_labels_add_attributes_unless_strict() {
        let s = store();
        let e = EntityId::new();
        let chunk = TxChunk::new("goals", e).update(json!({"color": "red"}));
        let tx = compile(std::slice::from_ref(&chunk), &s, lax()).unwrap();
        assert!(tx
            .steps
            .iter()
            .any(|step| matches!(step, TxStep::AddAttr { attr } if attr.forward_identity.label == "color")));
        let next = s.apply(&tx.steps, 1);
        let color = next.schema().forward("goals", "color").unwrap().id;
        assert_eq!(next.value(&e, &color), Some(&json!("red")));

        let err = compile(&[chunk], &s, strict()).unwrap_err();
        assert!(matches!(err, ValidationError::UnknownAttribute { .. }));
    }

    #[test]
    fn unknown_namespace_gets_id_attr_unless_strict() {
        let s = store();
        let chunk = TxChunk::new("notes", EntityId::new()).update(json!({"body": "x"}));
        let tx = compile(std::slice::from_ref(&chunk), &s, lax()).unwrap();
        let next = s.apply(&tx.steps, 1);
        assert!(next.schema().id_attr("notes").is_some());

        assert!(matches!(
            compile(&[chunk], &s, strict()),
            Err(ValidationError::UnknownNamespace { .. })
        ));
    }

    #[test]
    fn values_are_coerced() {
        let s = store();
        let tx = compile(
            &[TxChunk::new("goals", EntityId::new()).update(json!({"due": "1970-01-02"}))],
            &s,
            lax(),
        )
        .unwrap();
        assert!(tx
            .steps
            .iter()
            .any(|step| matches!(step, TxStep::AddTriple { v, .. } if *v == json!(86_400_000))));

        let err = compile(
            &[TxChunk::new("goals", EntityId::new()).update(json!({"due": "soon"}))],
            &s,
            lax(),
        )
        .unwrap_err();
        assert!(matches!(err, ValidationError::TypeMismatch { .. }));
    }

    #[test]
    fn create_requires_required_attrs() {
        let err = compile(
            &[TxChunk::new("goals", EntityId::new()).create(json!({"due": 1}))],
            &store(),
            lax(),
        )
        .unwrap_err();
        assert!(matches!(err, ValidationError::Required { label, .. } if label == "title"));
    }

    #[test]
    fn update_cannot_null_required() {
        let err = compile(
            &[TxChunk::new("goals", EntityId::new()).update(json!({"title": null}))],
            &store(),
            lax(),
        )
        .unwrap_err();
        assert!(matches!(err, ValidationError::Required { .. }));
    }

    #[test]
    fn uniqueness_checked_against_snapshot_and_tx() {
        let s = store();
        let a = EntityId::new();
        let tx = compile(
            &[TxChunk::new("users", a).update(json!({"email": "x@y"}))],
            &s,
            lax(),
        )
        .unwrap();
        let s = s.apply(&tx.steps, 1);

        let err = compile(
            &[TxChunk::new("users", EntityId::new()).update(json!({"email": "x@y"}))],
            &s,
            lax(),
        )
        .unwrap_err();
        assert!(matches!(err, ValidationError::NotUnique { .. }));

        // same entity rewriting its own value is fine
        assert!(compile(
            &[TxChunk::new("users", a).update(json!({"email": "x@y"}))],
            &s,
            lax()
        )
        .is_ok());

        let err = compile(
            &[
                TxChunk::new("users", EntityId::new()).update(json!({"email": "dup"})),
                TxChunk::new("users", EntityId::new()).update(json!({"email": "dup"})),
            ],
            &s,
            lax(),
        )
        .unwrap_err();
        assert!(matches!(err, ValidationError::NotUnique { .. }));
    }

    #[test]
    fn non_object_argument_is_rejected() {
        let err = compile(
            &[TxChunk::new("goals", EntityId::new()).update(json!([1, 2]))],
            &store(),
            lax(),
        )
        .unwrap_err();
        assert!(matches!(err, ValidationError::InvalidArgument { .. }));
    }

    #[test]
    fn merge_emits_deep_merge() {
        let tx = compile(
            &[TxChunk::new("goals", EntityId::new()).merge(json!({"meta": {"a": 1}}))],
            &store(),
            lax(),
        )
        .unwrap();
        assert!(matches!(tx.steps.last(), Some(TxStep::DeepMergeTriple { .. })));
    }

    // ===========================================
    // Links
    // ===========================================

    #[test]
    fn link_forward_and_reverse() {
        let s = store();
        let goal = EntityId::new();
        let todo = EntityId::new();
        let link_attr = s.schema().forward("todos", "goal").unwrap().id;

        let fwd = compile(
            &[TxChunk::new("todos", todo).link(json!({"goal": goal.to_string()}))],
            &s,
            lax(),
        )
        .unwrap();
        let rev = compile(
            &[TxChunk::new("goals", goal).link(json!({"todos": [todo.to_string()]}))],
            &s,
            lax(),
        )
        .unwrap();

        let expected = TxStep::AddTriple {
            e: todo,
            a: link_attr,
            v: json!(goal.to_string()),
        };
        assert!(fwd.steps.contains(&expected));
        assert!(rev.steps.contains(&expected));
    }

    #[test]
    fn unlink_retracts() {
        let s = store();
        let goal = EntityId::new();
        let tx = compile(
            &[TxChunk::new("todos", EntityId::new()).unlink(json!({"goal": goal.to_string()}))],
            &s,
            lax(),
        )
        .unwrap();
        assert!(matches!(tx.steps.as_slice(), [TxStep::RetractTriple { .. }]));
    }

    #[test]
    fn link_errors() {
        let s = store();
        let err = compile(
            &[TxChunk::new("todos", EntityId::new()).link(json!({"owner": EntityId::new().to_string()}))],
            &s,
            lax(),
        )
        .unwrap_err();
        assert!(matches!(err, ValidationError::UnknownLink { .. }));

        let err = compile(
            &[TxChunk::new("todos", EntityId::new()).link(json!({"goal": "not-a-uuid"}))],
            &s,
            lax(),
        )
        .unwrap_err();
        assert!(matches!(err, ValidationError::InvalidLinkTarget { .. }));

        let err = compile(
            &[TxChunk::new("todos", EntityId::new()).update(json!({"goal": EntityId::new().to_string()}))],
            &s,
            lax(),
        )
        .unwrap_err();
        assert!(matches!(err, ValidationError::LinkAttribute { .. }));
    }

    #[test]
    fn delete_and_rule_params() {
        let e = EntityId::new();
        let tx = compile(
            &[TxChunk::new("goals", e)
                .delete()
                .rule_params(json!({"secret": "s"}))],
            &store(),
            lax(),
        )
        .unwrap();
        assert_eq!(
            tx.steps,
            vec![TxStep::DeleteEntity {
                e,
                etype: "goals".into()
            }]
        );
        assert_eq!(tx.rule_params, Some(json!({"secret": "s"})));
    }
}
