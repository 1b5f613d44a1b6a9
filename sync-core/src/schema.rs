//! The schema dictionary: all known attributes, indexed by id and identity.
//!
//! Read-mostly and shared. Changes produce a new dictionary; readers holding
//! the old one keep a consistent view.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tessel_sync_types::{AttrId, Attribute, QueryHash, TxStep};

/// Copy-on-write attribute dictionary.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    inner: Arc<SchemaInner>,
}

#[derive(Debug, Default)]
struct SchemaInner {
    attrs: HashMap<AttrId, Attribute>,
    forward: HashMap<(String, String), AttrId>,
    reverse: HashMap<(String, String), AttrId>,
    namespaces: BTreeSet<String>,
}

impl SchemaInner {
    fn build(attrs: HashMap<AttrId, Attribute>) -> Self {
        let mut forward = HashMap::new();
        let mut reverse = HashMap::new();
        let mut namespaces = BTreeSet::new();
        for attr in attrs.values() {
            let fwd = &attr.forward_identity;
            forward.insert((fwd.etype.clone(), fwd.label.clone()), attr.id);
            namespaces.insert(fwd.etype.clone());
            if let Some(rev) = &attr.reverse_identity {
                reverse.insert((rev.etype.clone(), rev.label.clone()), attr.id);
                namespaces.insert(rev.etype.clone());
            }
        }
        Self {
            attrs,
            forward,
            reverse,
            namespaces,
        }
    }
}

/// How a link label resolved from a namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkDirection {
    /// The namespace owns the ref (`e` side).
    Forward,
    /// The namespace is the ref target (`v` side).
    Reverse,
}

impl Schema {
    /// Create an empty dictionary.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a dictionary from a list of attributes.
    pub fn from_attrs(attrs: impl IntoIterator<Item = Attribute>) -> Self {
        let map = attrs.into_iter().map(|a| (a.id, a)).collect();
        Self {
            inner: Arc::new(SchemaInner::build(map)),
        }
    }

    /// True when no attribute is known (schema never loaded).
    pub fn is_empty(&self) -> bool {
        self.inner.attrs.is_empty()
    }

    /// Number of attributes.
    pub fn len(&self) -> usize {
        self.inner.attrs.len()
    }

    /// Look up an attribute by id.
    pub fn get(&self, id: &AttrId) -> Option<&Attribute> {
        self.inner.attrs.get(id)
    }

    /// All attributes, in no particular order.
    pub fn attrs(&self) -> impl Iterator<Item = &Attribute> {
        self.inner.attrs.values()
    }

    /// Whether any attribute lives on (or points at) the namespace.
    pub fn has_namespace(&self, etype: &str) -> bool {
        self.inner.namespaces.contains(etype)
    }

    /// Attribute `etype.label` on its owning side.
    pub fn forward(&self, etype: &str, label: &str) -> Option<&Attribute> {
        self.inner
            .forward
            .get(&(etype.to_string(), label.to_string()))
            .and_then(|id| self.inner.attrs.get(id))
    }

    /// Attribute whose reverse identity is `etype.label`.
    pub fn reverse(&self, etype: &str, label: &str) -> Option<&Attribute> {
        self.inner
            .reverse
            .get(&(etype.to_string(), label.to_string()))
            .and_then(|id| self.inner.attrs.get(id))
    }

    /// The `id` attribute of a namespace.
    pub fn id_attr(&self, etype: &str) -> Option<&Attribute> {
        self.forward(etype, "id")
    }

    /// Resolve a link label from a namespace, forward first.
    ///
    /// Returns the ref attribute, its direction, and the namespace on the
    /// other side.
    pub fn link(&self, etype: &str, label: &str) -> Option<(&Attribute, LinkDirection, &str)> {
        if let Some(attr) = self.forward(etype, label).filter(|a| a.is_ref()) {
            let target = attr.reverse_identity.as_ref()?;
            return Some((attr, LinkDirection::Forward, target.etype.as_str()));
        }
        let attr = self.reverse(etype, label)?;
        Some((
            attr,
            LinkDirection::Reverse,
            attr.forward_identity.etype.as_str(),
        ))
    }

    /// Apply a schema-changing step. Other steps return the schema unchanged.
    pub fn with_step(&self, step: &TxStep) -> Schema {
        match step {
            TxStep::AddAttr { attr } => self.with_attr(attr.clone()),
            TxStep::DeleteAttr { id } => {
                if !self.inner.attrs.contains_key(id) {
                    return self.clone();
                }
                let mut attrs = self.inner.attrs.clone();
                attrs.remove(id);
                Self {
                    inner: Arc::new(SchemaInner::build(attrs)),
                }
            }
            TxStep::UpdateAttr { attr: patch } => {
                let mut attrs = self.inner.attrs.clone();
                match attrs.get_mut(&patch.id) {
                    Some(attr) => attr.apply_patch(patch),
                    None => return self.clone(),
                }
                Self {
                    inner: Arc::new(SchemaInner::build(attrs)),
                }
            }
            _ => self.clone(),
        }
    }

    /// Return a new dictionary with the attribute inserted or replaced.
    pub fn with_attr(&self, attr: Attribute) -> Schema {
        let mut attrs = self.inner.attrs.clone();
        attrs.insert(attr.id, attr);
        Self {
            inner: Arc::new(SchemaInner::build(attrs)),
        }
    }

    /// Stable fingerprint of the dictionary, sent with `init`.
    pub fn fingerprint(&self) -> String {
        let mut attrs: Vec<&Attribute> = self.inner.attrs.values().collect();
        attrs.sort_by_key(|a| a.id);
        let value = serde_json::to_value(attrs).unwrap_or(serde_json::Value::Null);
        QueryHash::of(&value).to_string()
    }

    /// Whether two handles share the same underlying dictionary.
    pub fn ptr_eq(&self, other: &Schema) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl PartialEq for Schema {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other) || self.inner.attrs == other.inner.attrs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessel_sync_types::{AttrPatch, Cardinality, Identity};

    fn todo_schema() -> (Schema, Attribute) {
        let owner = Attribute::link(
            Identity::new("todos", "owner"),
            Identity::new("users", "todos"),
            Cardinality::One,
        );
        let schema = Schema::from_attrs(vec![
            Attribute::id_attr("todos"),
            Attribute::blob("todos", "title"),
            Attribute::id_attr("users"),
            owner.clone(),
        ]);
        (schema, owner)
    }

    #[test]
    fn resolves_forward_and_reverse_identities() {
        let (schema, owner) = todo_schema();
        assert_eq!(schema.forward("todos", "owner").map(|a| a.id), Some(owner.id));
        assert_eq!(schema.reverse("users", "todos").map(|a| a.id), Some(owner.id));
        assert!(schema.forward("todos", "missing").is_none());
    }

    #[test]
    fn resolves_links_in_both_directions() {
        let (schema, owner) = todo_schema();

        let (attr, dir, target) = schema.link("todos", "owner").unwrap();
        assert_eq!(attr.id, owner.id);
        assert_eq!(dir, LinkDirection::Forward);
        assert_eq!(target, "users");

        let (attr, dir, target) = schema.link("users", "todos").unwrap();
        assert_eq!(attr.id, owner.id);
        assert_eq!(dir, LinkDirection::Reverse);
        assert_eq!(target, "todos");
    }

    #[test]
    fn blob_attrs_are_not_links() {
        let (schema, _) = todo_schema();
        assert!(schema.link("todos", "title").is_none());
    }

    #[test]
    fn with_step_is_copy_on_write() {
        let (schema, _) = todo_schema();
        let before = schema.clone();
        let added = schema.with_step(&TxStep::AddAttr {
            attr: Attribute::blob("todos", "done"),
        });

        assert!(added.forward("todos", "done").is_some());
        assert!(before.forward("todos", "done").is_none());
        assert!(before.ptr_eq(&schema));
    }

    #[test]
    fn update_and_delete_attr() {
        let (schema, owner) = todo_schema();
        let mut patch = AttrPatch::new(owner.id);
        patch.unique = Some(true);
        let updated = schema.with_step(&TxStep::UpdateAttr { attr: patch });
        assert!(updated.get(&owner.id).unwrap().unique);

        let deleted = updated.with_step(&TxStep::DeleteAttr { id: owner.id });
        assert!(deleted.get(&owner.id).is_none());
        assert!(deleted.reverse("users", "todos").is_none());
    }

    #[test]
    fn fingerprint_is_order_independent() {
        let a = Attribute::id_attr("todos");
        let b = Attribute::blob("todos", "title");
        let one = Schema::from_attrs(vec![a.clone(), b.clone()]);
        let two = Schema::from_attrs(vec![b, a]);
        assert_eq!(one.fingerprint(), two.fingerprint());
    }

    #[test]
    fn namespaces_include_reverse_side() {
        let (schema, _) = todo_schema();
        assert!(schema.has_namespace("users"));
        assert!(!schema.has_namespace("goals"));
    }
}
