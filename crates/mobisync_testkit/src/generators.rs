//! Property-based test generators using proptest.
//!
//! Provides strategies for random local mutation sequences and a reference
//! model of how the operation queue should fold them.

use crate::fixtures::item;
use mobisync_core::Row;
use mobisync_sync_engine::OperationKind;
use proptest::prelude::*;
use std::collections::{BTreeMap, BTreeSet};

/// A local write against one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mutation {
    /// Mutation kind.
    pub kind: OperationKind,
    /// Target item.
    pub item_id: String,
    /// New text for inserts and updates.
    pub text: String,
}

impl Mutation {
    /// The row written by an insert or update.
    pub fn row(&self) -> Row {
        item(&self.item_id, &self.text)
    }
}

/// Strategy for item ids drawn from a small pool, so mutations collide.
pub fn item_id_strategy() -> impl Strategy<Value = String> {
    prop::sample::select(vec!["a", "b", "c", "d"]).prop_map(str::to_string)
}

/// Strategy for operation kinds.
pub fn operation_kind_strategy() -> impl Strategy<Value = OperationKind> {
    prop_oneof![
        Just(OperationKind::Insert),
        Just(OperationKind::Update),
        Just(OperationKind::Delete),
    ]
}

/// Strategy for a single mutation.
pub fn mutation_strategy() -> impl Strategy<Value = Mutation> {
    (
        operation_kind_strategy(),
        item_id_strategy(),
        prop::string::string_regex("[a-z]{1,8}").expect("Invalid regex"),
    )
        .prop_map(|(kind, item_id, text)| Mutation {
            kind,
            item_id,
            text,
        })
}

/// Strategy for mutation sequences of up to `max_len` writes.
pub fn mutations_strategy(max_len: usize) -> impl Strategy<Value = Vec<Mutation>> {
    prop::collection::vec(mutation_strategy(), 0..=max_len)
}

/// What the queue should do with a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelStep {
    /// A new operation joined the end of the queue.
    Queued,
    /// An existing operation absorbed the mutation.
    Coalesced,
    /// The mutation cancelled the existing operation.
    Cancelled,
    /// The mutation is not allowed.
    Rejected,
}

/// Reference model of one table: local rows plus the queue.
#[derive(Debug, Default, Clone)]
pub struct QueueModel {
    rows: BTreeSet<String>,
    queue: BTreeMap<String, (u64, OperationKind)>,
    next_sequence: u64,
}

impl QueueModel {
    /// An empty table with an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies a mutation and reports what the queue should do.
    pub fn apply(&mut self, mutation: &Mutation) -> ModelStep {
        use OperationKind::*;

        let id = mutation.item_id.clone();
        let existing = self.queue.get(&id).map(|(_, kind)| *kind);

        let allowed = match (existing, mutation.kind) {
            (Some(_), Insert) => false,
            (Some(Delete), Update | Delete) => false,
            (None, Insert) => !self.rows.contains(&id),
            _ => true,
        };
        if !allowed {
            return ModelStep::Rejected;
        }

        match mutation.kind {
            Delete => self.rows.remove(&id),
            Insert | Update => self.rows.insert(id.clone()),
        };

        let Some(existing) = existing else {
            self.next_sequence += 1;
            self.queue.insert(id, (self.next_sequence, mutation.kind));
            return ModelStep::Queued;
        };

        let folded = match (existing, mutation.kind) {
            (Insert, Delete) => {
                self.queue.remove(&id);
                return ModelStep::Cancelled;
            }
            (Insert, _) => Insert,
            (_, Delete) => Delete,
            _ => Update,
        };
        if let Some(entry) = self.queue.get_mut(&id) {
            entry.1 = folded;
        }
        ModelStep::Coalesced
    }

    /// Expected queue as `(item_id, kind)` in execution order.
    pub fn queue(&self) -> Vec<(String, OperationKind)> {
        let mut ops: Vec<_> = self
            .queue
            .iter()
            .map(|(id, (seq, kind))| (*seq, id.clone(), *kind))
            .collect();
        ops.sort_by_key(|(seq, _, _)| *seq);
        ops.into_iter().map(|(_, id, kind)| (id, kind)).collect()
    }

    /// Ids expected in the local table.
    pub fn rows(&self) -> Vec<String> {
        self.rows.iter().cloned().collect()
    }
}
