//! The local triple store.
//!
//! A [`Store`] is an immutable snapshot. [`Store::apply`] returns a new
//! snapshot and leaves the original untouched, so readers holding an older
//! snapshot never observe a half-applied transaction. Internally every
//! index is behind an `Arc` and only cloned when a write actually touches it.
//!
//! Invariants maintained by every write:
//! - a cardinality-one attribute holds at most one value per entity;
//! - a unique attribute never holds the same value on two entities;
//! - link values are normalized entity id strings, mirrored in the
//!   reverse-reference index.

use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tessel_sync_types::{AttrId, Cardinality, EntityId, OnDelete, Triple, TxStep};

use crate::merge::deep_merge;
use crate::schema::{LinkDirection, Schema};

/// One value of an attribute on an entity.
#[derive(Debug, Clone, PartialEq)]
pub struct Fact {
    /// The value.
    pub value: Value,
    /// Creation stamp of the triple.
    pub created_at: u64,
}

/// All facts sharing one entity id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Entity {
    facts: BTreeMap<AttrId, Vec<Fact>>,
}

impl Entity {
    /// Facts for an attribute (empty when unset).
    pub fn facts(&self, attr: &AttrId) -> &[Fact] {
        self.facts.get(attr).map(Vec::as_slice).unwrap_or(&[])
    }

    /// First value of an attribute.
    pub fn value(&self, attr: &AttrId) -> Option<&Value> {
        self.facts(attr).first().map(|f| &f.value)
    }

    /// All values of an attribute.
    pub fn values<'a>(&'a self, attr: &AttrId) -> impl Iterator<Item = &'a Value> + 'a {
        self.facts(attr).iter().map(|f| &f.value)
    }

    /// Attributes set on this entity.
    pub fn attr_ids(&self) -> impl Iterator<Item = &AttrId> {
        self.facts.keys()
    }

    /// Creation time: the earliest stamp among its triples.
    pub fn created_at(&self) -> u64 {
        self.facts
            .values()
            .flatten()
            .map(|f| f.created_at)
            .min()
            .unwrap_or(0)
    }

    /// True when the entity has no facts.
    pub fn is_empty(&self) -> bool {
        self.facts.is_empty()
    }
}

/// What a write touched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    /// Namespaces whose entities or links changed.
    pub etypes: BTreeSet<String>,
    /// Whether the schema dictionary changed.
    pub schema_changed: bool,
}

impl ChangeSet {
    /// True when nothing changed.
    pub fn is_empty(&self) -> bool {
        self.etypes.is_empty() && !self.schema_changed
    }

    /// Whether a query depending on `etypes` may be affected.
    pub fn touches(&self, etypes: &BTreeSet<String>) -> bool {
        self.schema_changed || !self.etypes.is_disjoint(etypes)
    }

    /// Fold another change set into this one.
    pub fn extend(&mut self, other: ChangeSet) {
        self.etypes.extend(other.etypes);
        self.schema_changed |= other.schema_changed;
    }
}

/// Copy-on-write snapshot of attributes and triples.
#[derive(Debug, Clone, Default)]
pub struct Store {
    schema: Schema,
    entities: Arc<BTreeMap<EntityId, Arc<Entity>>>,
    by_etype: Arc<HashMap<String, BTreeSet<EntityId>>>,
    /// target -> (attr, source)
    refs: Arc<HashMap<EntityId, BTreeSet<(AttrId, EntityId)>>>,
    unique: Arc<HashMap<(AttrId, String), EntityId>>,
}

impl Store {
    /// Create an empty store over a schema.
    pub fn new(schema: Schema) -> Self {
        Self {
            schema,
            ..Self::default()
        }
    }

    /// Build a store from server triples. Later triples win on
    /// cardinality-one conflicts.
    pub fn from_triples<'a>(schema: Schema, triples: impl IntoIterator<Item = &'a Triple>) -> Self {
        let mut store = Self::new(schema);
        let mut changes = ChangeSet::default();
        for t in triples {
            store.insert_fact(t.e, t.a, t.v.clone(), t.created_at, &mut changes);
        }
        store
    }

    /// Apply transaction steps, stamping new triples with `stamp`.
    pub fn apply(&self, steps: &[TxStep], stamp: u64) -> Store {
        self.apply_with_changes(steps, stamp).0
    }

    /// Apply transaction steps and report what changed.
    ///
    /// Total: steps referencing unknown attributes, malformed links, or
    /// conflicting unique values are skipped.
    pub fn apply_with_changes(&self, steps: &[TxStep], stamp: u64) -> (Store, ChangeSet) {
        let mut next = self.clone();
        let mut changes = ChangeSet::default();
        for step in steps {
            next.apply_step(step, stamp, &mut changes);
        }
        (next, changes)
    }

    /// The schema dictionary of this snapshot.
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Look up an entity.
    pub fn entity(&self, e: &EntityId) -> Option<&Entity> {
        self.entities.get(e).map(Arc::as_ref)
    }

    /// Whether the entity has any facts.
    pub fn contains(&self, e: &EntityId) -> bool {
        self.entities.contains_key(e)
    }

    /// Entities holding at least one attribute of the namespace.
    pub fn entities_of<'a>(&'a self, etype: &str) -> impl Iterator<Item = EntityId> + 'a {
        self.by_etype
            .get(etype)
            .into_iter()
            .flat_map(|set| set.iter().copied())
    }

    /// Whether the entity belongs to the namespace.
    pub fn is_of(&self, e: &EntityId, etype: &str) -> bool {
        self.by_etype
            .get(etype)
            .map(|set| set.contains(e))
            .unwrap_or(false)
    }

    /// First value of `e.a`.
    pub fn value(&self, e: &EntityId, a: &AttrId) -> Option<&Value> {
        self.entity(e).and_then(|ent| ent.value(a))
    }

    /// Entities linked from `e` through `attr` in the given direction.
    pub fn linked(&self, e: &EntityId, attr: &AttrId, dir: LinkDirection) -> Vec<EntityId> {
        match dir {
            LinkDirection::Forward => self
                .entity(e)
                .map(|ent| {
                    ent.values(attr)
                        .filter_map(|v| v.as_str().and_then(|s| EntityId::parse(s).ok()))
                        .collect()
                })
                .unwrap_or_default(),
            LinkDirection::Reverse => self
                .refs
                .get(e)
                .map(|incoming| {
                    incoming
                        .iter()
                        .filter(|(a, _)| a == attr)
                        .map(|(_, source)| *source)
                        .collect()
                })
                .unwrap_or_default(),
        }
    }

    /// Entity holding `value` on a unique attribute.
    pub fn find_unique(&self, attr: &AttrId, value: &Value) -> Option<EntityId> {
        self.unique.get(&(*attr, value.to_string())).copied()
    }

    /// Number of entities.
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    /// True when the store holds no entities.
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// All triples, ordered by entity then attribute.
    pub fn triples(&self) -> Vec<Triple> {
        let mut out = Vec::new();
        for (e, entity) in self.entities.iter() {
            for (a, facts) in entity.facts.iter() {
                for fact in facts {
                    out.push(Triple::new(*e, *a, fact.value.clone(), fact.created_at));
                }
            }
        }
        out
    }

    // =====================================================================
    // Writes
    // =====================================================================

    fn apply_step(&mut self, step: &TxStep, stamp: u64, changes: &mut ChangeSet) {
        match step {
            TxStep::AddTriple { e, a, v } => {
                self.insert_fact(*e, *a, v.clone(), stamp, changes);
            }
            TxStep::RetractTriple { e, a, v } => {
                let v = self.normalize(a, v.clone());
                self.remove_fact(*e, *a, &v, changes);
            }
            TxStep::DeepMergeTriple { e, a, v } => {
                let current = self.value(e, a).cloned().unwrap_or(Value::Null);
                let merged = deep_merge(&current, v);
                self.insert_fact(*e, *a, merged, stamp, changes);
            }
            TxStep::DeleteEntity { e, etype } => {
                changes.etypes.insert(etype.clone());
                self.cascade_delete(*e, changes);
            }
            TxStep::AddAttr { .. } | TxStep::UpdateAttr { .. } => {
                self.schema = self.schema.with_step(step);
                self.rebuild_unique();
                changes.schema_changed = true;
            }
            TxStep::DeleteAttr { id } => {
                let holders: Vec<(EntityId, Value)> = self
                    .entities
                    .iter()
                    .flat_map(|(e, ent)| ent.values(id).map(move |v| (*e, v.clone())))
                    .collect();
                for (e, v) in holders {
                    self.remove_fact(e, *id, &v, changes);
                }
                self.schema = self.schema.with_step(step);
                changes.schema_changed = true;
            }
        }
    }

    /// Link values are stored as canonical id strings.
    fn normalize(&self, a: &AttrId, v: Value) -> Value {
        match self.schema.get(a) {
            Some(attr) if attr.is_ref() => match v.as_str().and_then(|s| EntityId::parse(s).ok()) {
                Some(target) => Value::String(target.to_string()),
                None => v,
            },
            _ => v,
        }
    }

    fn insert_fact(
        &mut self,
        e: EntityId,
        a: AttrId,
        v: Value,
        created_at: u64,
        changes: &mut ChangeSet,
    ) {
        let schema = self.schema.clone();
        let Some(attr) = schema.get(&a) else {
            return;
        };

        let target = if attr.is_ref() {
            match v.as_str().and_then(|s| EntityId::parse(s).ok()) {
                Some(target) => Some(target),
                None => return,
            }
        } else {
            None
        };
        let v = match target {
            Some(target) => Value::String(target.to_string()),
            None => v,
        };

        if attr.unique {
            if let Some(holder) = self.unique.get(&(a, v.to_string())) {
                if *holder != e {
                    return;
                }
            }
        }

        if let Some(entity) = self.entities.get(&e) {
            if entity.values(&a).any(|existing| *existing == v) {
                return;
            }
            if attr.cardinality == Cardinality::One {
                let old: Vec<Value> = entity.values(&a).cloned().collect();
                for old_v in old {
                    self.remove_fact(e, a, &old_v, changes);
                }
            }
        }

        let entities = Arc::make_mut(&mut self.entities);
        let entity = Arc::make_mut(entities.entry(e).or_default());
        entity.facts.entry(a).or_default().push(Fact {
            value: v.clone(),
            created_at,
        });

        let etype = attr.forward_identity.etype.clone();
        Arc::make_mut(&mut self.by_etype)
            .entry(etype.clone())
            .or_default()
            .insert(e);
        changes.etypes.insert(etype);

        if let Some(target) = target {
            Arc::make_mut(&mut self.refs)
                .entry(target)
                .or_default()
                .insert((a, e));
            if let Some(rev) = &attr.reverse_identity {
                changes.etypes.insert(rev.etype.clone());
            }
        }
        if attr.unique {
            Arc::make_mut(&mut self.unique).insert((a, v.to_string()), e);
        }
    }

    fn remove_fact(&mut self, e: EntityId, a: AttrId, v: &Value, changes: &mut ChangeSet) -> bool {
        let Some(entity) = self.entities.get(&e) else {
            return false;
        };
        let Some(pos) = entity.facts(&a).iter().position(|f| f.value == *v) else {
            return false;
        };

        let entities = Arc::make_mut(&mut self.entities);
        let mut now_empty = false;
        if let Some(slot) = entities.get_mut(&e) {
            let entity = Arc::make_mut(slot);
            if let Some(facts) = entity.facts.get_mut(&a) {
                facts.remove(pos);
                if facts.is_empty() {
                    entity.facts.remove(&a);
                }
            }
            now_empty = entity.is_empty();
        }
        if now_empty {
            entities.remove(&e);
        }

        let schema = self.schema.clone();
        let Some(attr) = schema.get(&a) else {
            return true;
        };
        let etype = &attr.forward_identity.etype;
        changes.etypes.insert(etype.clone());

        let still_member = self.entities.get(&e).is_some_and(|ent| {
            ent.attr_ids().any(|id| {
                schema
                    .get(id)
                    .is_some_and(|other| other.forward_identity.etype == *etype)
            })
        });
        if !still_member {
            let by_etype = Arc::make_mut(&mut self.by_etype);
            if let Some(set) = by_etype.get_mut(etype) {
                set.remove(&e);
                if set.is_empty() {
                    by_etype.remove(etype);
                }
            }
        }

        if attr.is_ref() {
            if let Some(target) = v.as_str().and_then(|s| EntityId::parse(s).ok()) {
                let refs = Arc::make_mut(&mut self.refs);
                if let Some(set) = refs.get_mut(&target) {
                    set.remove(&(a, e));
                    if set.is_empty() {
                        refs.remove(&target);
                    }
                }
            }
            if let Some(rev) = &attr.reverse_identity {
                changes.etypes.insert(rev.etype.clone());
            }
        }
        if attr.unique {
            let key = (a, v.to_string());
            if self.unique.get(&key) == Some(&e) {
                Arc::make_mut(&mut self.unique).remove(&key);
            }
        }
        true
    }

    /// Delete an entity, every link pointing at it, and everything reachable
    /// through cascading links. Cycles are visited once.
    fn cascade_delete(&mut self, root: EntityId, changes: &mut ChangeSet) {
        let mut stack = vec![root];
        let mut visited = BTreeSet::new();

        while let Some(current) = stack.pop() {
            if !visited.insert(current) {
                continue;
            }
            let schema = self.schema.clone();

            if let Some(entity) = self.entities.get(&current).cloned() {
                for (a, facts) in entity.facts.iter() {
                    let cascades = schema
                        .get(a)
                        .is_some_and(|attr| attr.is_ref() && attr.on_delete_reverse == Some(OnDelete::Cascade));
                    for fact in facts {
                        if cascades {
                            if let Some(target) =
                                fact.value.as_str().and_then(|s| EntityId::parse(s).ok())
                            {
                                stack.push(target);
                            }
                        }
                        self.remove_fact(current, *a, &fact.value, changes);
                    }
                }
            }

            if let Some(incoming) = self.refs.get(&current).cloned() {
                let as_value = Value::String(current.to_string());
                for (a, source) in incoming {
                    if schema
                        .get(&a)
                        .is_some_and(|attr| attr.on_delete == Some(OnDelete::Cascade))
                    {
                        stack.push(source);
                    }
                    self.remove_fact(source, a, &as_value, changes);
                }
            }
        }
    }

    fn rebuild_unique(&mut self) {
        let mut unique = HashMap::new();
        for attr in self.schema.attrs().filter(|a| a.unique) {
            for (e, entity) in self.entities.iter() {
                for v in entity.values(&attr.id) {
                    unique.entry((attr.id, v.to_string())).or_insert(*e);
                }
            }
        }
        self.unique = Arc::new(unique);
    }
}

impl PartialEq for Store {
    fn eq(&self, other: &Self) -> bool {
        self.schema == other.schema && self.entities == other.entities
    }
}
