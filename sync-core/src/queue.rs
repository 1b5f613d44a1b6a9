//! The optimistic mutation log.
//!
//! Mutations move through the log in this order:
//! 1. `enqueue()` - appended as [`MutationStatus::Pending`]
//! 2. `mark_sent()` - written to the current connection
//! 3. `ack()` - confirmed by the server with a tx-id
//! 4. `prune_confirmed()` - dropped once every query has seen that tx-id
//!
//! Until it is pruned, a confirmed mutation is hidden from any query whose
//! server result is already at or past its tx-id
//! ([`MutationQueue::optimistic_as_of`]), and it no longer counts toward the
//! queue's capacity.
//!
//! A rejection removes the mutation outright. Because the optimistic
//! snapshot is always recomputed as `base ⊕ overlay` in log order, removing
//! one entry never disturbs its siblings.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use tessel_sync_types::{ClientEventId, Transact, TxId, TxStep};

use crate::error::ValidationError;
use crate::store::{ChangeSet, Store};

/// Default capacity of the mutation log.
pub const DEFAULT_QUEUE_CAPACITY: usize = 10_000;

/// Where a mutation is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum MutationStatus {
    /// Not yet written to the current connection.
    Pending,
    /// Written, awaiting ack.
    Sent,
    /// Acked; kept in the overlay until queries catch up.
    Confirmed {
        /// Server transaction id.
        tx_id: TxId,
    },
}

/// A transaction in the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mutation {
    /// Client-generated id, echoed in `transact-ok` / `error`.
    pub id: ClientEventId,
    /// Ordered steps.
    pub steps: Vec<TxStep>,
    /// Local stamp for optimistic triples (epoch millis).
    pub created_at: u64,
    /// Ask the server to skip permission checks on cascaded deletes.
    #[serde(default)]
    pub cascade_bypass_permissions: bool,
    /// Permission rule parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_params: Option<Value>,
    /// Lifecycle state.
    pub status: MutationStatus,
}

impl Mutation {
    /// Create a pending mutation.
    pub fn new(steps: Vec<TxStep>, created_at: u64) -> Self {
        Self {
            id: ClientEventId::new(),
            steps,
            created_at,
            cascade_bypass_permissions: false,
            rule_params: None,
            status: MutationStatus::Pending,
        }
    }

    /// Set the cascade permission bypass flag.
    pub fn with_cascade_bypass(mut self, bypass: bool) -> Self {
        self.cascade_bypass_permissions = bypass;
        self
    }

    /// Attach rule parameters.
    pub fn with_rule_params(mut self, params: Option<Value>) -> Self {
        self.rule_params = params;
        self
    }

    /// The `transact` frame for this mutation.
    pub fn to_frame(&self) -> Transact {
        Transact {
            tx_steps: self.steps.clone(),
            client_event_id: self.id,
            cascade_bypass_permissions: self.cascade_bypass_permissions,
            rule_params: self.rule_params.clone(),
        }
    }
}

/// Ordered log of not-yet-pruned mutations.
#[derive(Debug, Clone)]
pub struct MutationQueue {
    capacity: usize,
    log: VecDeque<Mutation>,
}

impl Default for MutationQueue {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

impl MutationQueue {
    /// Create an empty log.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            log: VecDeque::new(),
        }
    }

    /// Restore a log loaded from disk. Nothing restored counts as sent.
    pub fn restore(capacity: usize, mutations: impl IntoIterator<Item = Mutation>) -> Self {
        let mut queue = Self::new(capacity);
        queue.log.extend(mutations);
        queue.mark_all_unsent();
        queue
    }

    /// Append a mutation. Confirmed mutations waiting to be pruned do not
    /// count toward the capacity.
    pub fn enqueue(&mut self, mutation: Mutation) -> Result<(), ValidationError> {
        if self.unconfirmed().count() >= self.capacity {
            return Err(ValidationError::QueueFull {
                capacity: self.capacity,
            });
        }
        self.log.push_back(mutation);
        Ok(())
    }

    /// Record that a mutation was written to the connection.
    pub fn mark_sent(&mut self, id: &ClientEventId) {
        if let Some(m) = self.get_mut(id) {
            if m.status == MutationStatus::Pending {
                m.status = MutationStatus::Sent;
            }
        }
    }

    /// The connection dropped: everything unacknowledged must be resent.
    pub fn mark_all_unsent(&mut self) {
        for m in self.log.iter_mut() {
            if m.status == MutationStatus::Sent {
                m.status = MutationStatus::Pending;
            }
        }
    }

    /// Mark a mutation confirmed. Returns false for unknown ids.
    pub fn ack(&mut self, id: &ClientEventId, tx_id: TxId) -> bool {
        match self.get_mut(id) {
            Some(m) => {
                m.status = MutationStatus::Confirmed { tx_id };
                true
            }
            None => false,
        }
    }

    /// Remove a rejected mutation.
    pub fn reject(&mut self, id: &ClientEventId) -> Option<Mutation> {
        let pos = self.log.iter().position(|m| m.id == *id)?;
        self.log.remove(pos)
    }

    /// Mutations that still need to be written, in enqueue order.
    pub fn unsent(&self) -> impl Iterator<Item = &Mutation> {
        self.log
            .iter()
            .filter(|m| m.status == MutationStatus::Pending)
    }

    /// Drop confirmed mutations whose tx-id every query has processed.
    pub fn prune_confirmed(&mut self, through: TxId) -> Vec<ClientEventId> {
        let mut pruned = Vec::new();
        self.log.retain(|m| match m.status {
            MutationStatus::Confirmed { tx_id } if tx_id <= through => {
                pruned.push(m.id);
                false
            }
            _ => true,
        });
        pruned
    }

    /// Every mutation still applied on top of the base store.
    pub fn overlay(&self) -> impl Iterator<Item = &Mutation> {
        self.log.iter()
    }

    /// Mutations not yet confirmed (the durable part of the log).
    pub fn unconfirmed(&self) -> impl Iterator<Item = &Mutation> {
        self.log
            .iter()
            .filter(|m| !matches!(m.status, MutationStatus::Confirmed { .. }))
    }

    /// `base ⊕ overlay`, applied in log order.
    pub fn optimistic(&self, base: &Store) -> Store {
        self.optimistic_with_changes(base).0
    }

    /// Like [`MutationQueue::optimistic`], also reporting what the overlay touched.
    pub fn optimistic_with_changes(&self, base: &Store) -> (Store, ChangeSet) {
        apply_all(base, self.log.iter())
    }

    /// Whether a confirmed mutation with a tx-id at or below `processed` is
    /// still in the overlay.
    pub fn has_confirmed_through(&self, processed: TxId) -> bool {
        self.log
            .iter()
            .any(|m| matches!(m.status, MutationStatus::Confirmed { tx_id } if tx_id <= processed))
    }

    /// The snapshot seen by a query whose server result already reflects
    /// every transaction up to `processed`. Confirmed mutations at or below
    /// it are skipped: the server data is authoritative for them.
    pub fn optimistic_as_of(&self, base: &Store, processed: TxId) -> Store {
        let visible = self.log.iter().filter(|m| match m.status {
            MutationStatus::Confirmed { tx_id } => tx_id > processed,
            _ => true,
        });
        apply_all(base, visible).0
    }

    /// Look up a mutation.
    pub fn get(&self, id: &ClientEventId) -> Option<&Mutation> {
        self.log.iter().find(|m| m.id == *id)
    }

    fn get_mut(&mut self, id: &ClientEventId) -> Option<&mut Mutation> {
        self.log.iter_mut().find(|m| m.id == *id)
    }

    /// Number of mutations in the log.
    pub fn len(&self) -> usize {
        self.log.len()
    }

    /// True when the log is empty.
    pub fn is_empty(&self) -> bool {
        self.log.is_empty()
    }

    /// Capacity of the log.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

fn apply_all<'a>(base: &Store, mutations: impl Iterator<Item = &'a Mutation>) -> (Store, ChangeSet) {
    let mut store = base.clone();
    let mut changes = ChangeSet::default();
    for m in mutations {
        let (next, touched) = store.apply_with_changes(&m.steps, m.created_at);
        store = next;
        changes.extend(touched);
    }
    (store, changes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Schema;
    use proptest::prelude::*;
    use serde_json::json;
    use tessel_sync_types::{Attribute, EntityId};

    fn setup() -> (Store, Attribute) {
        let title = Attribute::blob("goals", "title");
        let schema = Schema::from_attrs(vec![Attribute::id_attr("goals"), title.clone()]);
        (Store::new(schema), title)
    }

    fn set_title(title: &Attribute, e: EntityId, v: &str, stamp: u64) -> Mutation {
        Mutation::new(
            vec![TxStep::AddTriple {
                e,
                a: title.id,
                v: json!(v),
            }],
            stamp,
        )
    }

    // ===========================================
    // Lifecycle
    // ===========================================

    #[test]
    fn enqueue_respects_capacity() {
        let (_, title) = setup();
        let mut q = MutationQueue::new(1);
        q.enqueue(set_title(&title, EntityId::new(), "a", 1)).unwrap();
        let err = q
            .enqueue(set_title(&title, EntityId::new(), "b", 2))
            .unwrap_err();
        assert_eq!(err, ValidationError::QueueFull { capacity: 1 });
    }

    #[test]
    fn confirmed_mutations_do_not_count_toward_capacity() {
        let (_, title) = setup();
        let mut q = MutationQueue::new(1);
        let m = set_title(&title, EntityId::new(), "a", 1);
        q.enqueue(m.clone()).unwrap();
        q.ack(&m.id, TxId::new(4));
        q.enqueue(set_title(&title, EntityId::new(), "b", 2)).unwrap();
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn unsent_preserves_enqueue_order() {
        let (_, title) = setup();
        let mut q = MutationQueue::default();
        let ms: Vec<Mutation> = (0..3)
            .map(|i| set_title(&title, EntityId::new(), "x", i))
            .collect();
        for m in &ms {
            q.enqueue(m.clone()).unwrap();
        }
        q.mark_sent(&ms[0].id);
        let unsent: Vec<ClientEventId> = q.unsent().map(|m| m.id).collect();
        assert_eq!(unsent, vec![ms[1].id, ms[2].id]);

        q.mark_all_unsent();
        let unsent: Vec<ClientEventId> = q.unsent().map(|m| m.id).collect();
        assert_eq!(unsent, ms.iter().map(|m| m.id).collect::<Vec<_>>());
    }

    #[test]
    fn confirmed_mutations_are_not_resent() {
        let (_, title) = setup();
        let mut q = MutationQueue::default();
        let m = set_title(&title, EntityId::new(), "x", 1);
        q.enqueue(m.clone()).unwrap();
        q.mark_sent(&m.id);
        assert!(q.ack(&m.id, TxId::new(7)));
        q.mark_all_unsent();
        assert_eq!(q.unsent().count(), 0);
        assert_eq!(q.overlay().count(), 1);
        assert_eq!(q.unconfirmed().count(), 0);
    }

    #[test]
    fn prune_waits_for_tx_id() {
        let (_, title) = setup();
        let mut q = MutationQueue::default();
        let m = set_title(&title, EntityId::new(), "x", 1);
        q.enqueue(m.clone()).unwrap();
        q.ack(&m.id, TxId::new(10));
        assert!(q.prune_confirmed(TxId::new(9)).is_empty());
        assert_eq!(q.prune_confirmed(TxId::new(10)), vec![m.id]);
        assert!(q.is_empty());
    }

    #[test]
    fn ack_unknown_is_false() {
        let mut q = MutationQueue::default();
        assert!(!q.ack(&ClientEventId::new(), TxId::new(1)));
        assert!(q.reject(&ClientEventId::new()).is_none());
    }

    #[test]
    fn restore_resets_sent() {
        let (_, title) = setup();
        let mut m = set_title(&title, EntityId::new(), "x", 1);
        m.status = MutationStatus::Sent;
        let q = MutationQueue::restore(10, vec![m.clone()]);
        assert_eq!(q.unsent().next().map(|m| m.id), Some(m.id));
    }

    #[test]
    fn mutation_serde_roundtrip() {
        let (_, title) = setup();
        let mut m = set_title(&title, EntityId::new(), "x", 1).with_cascade_bypass(true);
        m.status = MutationStatus::Confirmed { tx_id: TxId::new(3) };
        let json = serde_json::to_string(&m).unwrap();
        let back: Mutation = serde_json::from_str(&json).unwrap();
        assert_eq!(back, m);
    }

    // ===========================================
    // Optimistic snapshot
    // ===========================================

    #[test]
    fn rejection_rolls_back_only_that_mutation() {
        let (base, title) = setup();
        let (e1, e2, e3) = (EntityId::new(), EntityId::new(), EntityId::new());
        let mut q = MutationQueue::default();
        let m1 = set_title(&title, e1, "one", 1);
        let m2 = set_title(&title, e2, "two", 2);
        let m3 = set_title(&title, e3, "three", 3);
        for m in [&m1, &m2, &m3] {
            q.enqueue(m.clone()).unwrap();
        }

        q.reject(&m2.id);
        let store = q.optimistic(&base);
        assert_eq!(store.value(&e1, &title.id), Some(&json!("one")));
        assert_eq!(store.value(&e2, &title.id), None);
        assert_eq!(store.value(&e3, &title.id), Some(&json!("three")));
    }

    #[test]
    fn later_pending_patch_stacks_on_earlier() {
        let (base, title) = setup();
        let e = EntityId::new();
        let mut q = MutationQueue::default();
        let m1 = set_title(&title, e, "a", 1);
        let m2 = set_title(&title, e, "b", 2);
        q.enqueue(m1.clone()).unwrap();
        q.enqueue(m2).unwrap();
        q.ack(&m1.id, TxId::new(1));
        assert_eq!(q.optimistic(&base).value(&e, &title.id), Some(&json!("b")));
    }

    #[test]
    fn query_past_the_ack_skips_the_confirmed_write() {
        let (base, title) = setup();
        let e = EntityId::new();
        let server = base.apply(
            &[TxStep::AddTriple {
                e,
                a: title.id,
                v: json!("theirs"),
            }],
            3,
        );
        let other = EntityId::new();
        let mut q = MutationQueue::default();
        let mine = set_title(&title, e, "mine", 1);
        let pending = set_title(&title, other, "pending", 2);
        q.enqueue(mine.clone()).unwrap();
        q.enqueue(pending.clone()).unwrap();
        q.ack(&mine.id, TxId::new(2));

        assert!(!q.has_confirmed_through(TxId::new(1)));
        assert!(q.has_confirmed_through(TxId::new(3)));

        let lagging = q.optimistic_as_of(&server, TxId::new(1));
        assert_eq!(lagging.value(&e, &title.id), Some(&json!("mine")));

        let current = q.optimistic_as_of(&server, TxId::new(3));
        assert_eq!(current.value(&e, &title.id), Some(&json!("theirs")));
        assert_eq!(current.value(&other, &title.id), Some(&json!("pending")));
    }

    proptest! {
        // M2 rejected, M1 and M3 confirmed: the result is base ⊕ M1 ⊕ M3
        // whatever order the outcomes arrive in.
        #[test]
        fn rollback_independent_of_ack_order(order in Just(vec![0usize, 1, 2]).prop_shuffle()) {
            let (base, title) = setup();
            let e = EntityId::new();
            let other = EntityId::new();
            let ms = [
                set_title(&title, e, "m1", 1),
                set_title(&title, other, "m2", 2),
                set_title(&title, e, "m3", 3),
            ];
            let mut q = MutationQueue::default();
            for m in &ms {
                q.enqueue(m.clone()).unwrap();
            }
            for (n, i) in order.iter().enumerate() {
                if *i == 1 {
                    q.reject(&ms[1].id);
                } else {
                    q.ack(&ms[*i].id, TxId::new(n as u64 + 1));
                }
            }

            let expected = base
                .apply(&ms[0].steps, ms[0].created_at)
                .apply(&ms[2].steps, ms[2].created_at);
            prop_assert_eq!(q.optimistic(&base), expected);
        }
    }
}
