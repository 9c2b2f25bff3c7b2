//! Execution-scoped storage of produced values.
use std::collections::HashMap;

use crate::core::{Dynamic, Ordinal};
use crate::item::{Cardinality, ItemId};

#[derive(Clone)]
struct Value {
    ordinal: Ordinal,
    data: Dynamic,
}

enum Slot {
    Single(Value),
    Many(Vec<Value>),
}

/// Maps item identities to the values produced for them during one
/// execution.
///
/// Simple and weak items hold at most one value. Multi items collect every
/// contribution and are read back ordered by the producing ordinal, then by
/// the item's natural order, then by insertion order.
#[derive(Default)]
pub(crate) struct ItemStore {
    slots: HashMap<ItemId, Slot>,
}

impl ItemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a value. Fails with the item when a simple or weak item already
    /// holds a value.
    pub fn insert(&mut self, item: ItemId, ordinal: Ordinal, data: Dynamic) -> Result<(), ItemId> {
        let value = Value { ordinal, data };

        match item.cardinality() {
            Cardinality::Multi => {
                if let Slot::Many(values) = self
                    .slots
                    .entry(item)
                    .or_insert_with(|| Slot::Many(Vec::new()))
                {
                    values.push(value);
                }
                Ok(())
            }
            Cardinality::Simple | Cardinality::Weak => {
                if self.slots.contains_key(&item) {
                    return Err(item);
                }
                self.slots.insert(item, Slot::Single(value));
                Ok(())
            }
        }
    }

    pub fn contains(&self, item: &ItemId) -> bool {
        self.slots.contains_key(item)
    }

    /// Every value stored for the item, in retrieval order.
    pub fn get_all(&self, item: &ItemId) -> Vec<&Dynamic> {
        match self.slots.get(item) {
            None => Vec::new(),
            Some(Slot::Single(value)) => vec![&value.data],
            Some(Slot::Many(values)) => {
                let mut sorted: Vec<&Value> = values.iter().collect();
                // stable, so equal entries keep insertion order
                sorted.sort_by(|a, b| {
                    a.ordinal
                        .cmp(&b.ordinal)
                        .then_with(|| item.order(&*a.data, &*b.data))
                });
                sorted.into_iter().map(|value| &value.data).collect()
            }
        }
    }

    /// Copies out the values of the given items, in retrieval order.
    pub fn snapshot(&self, items: impl IntoIterator<Item = ItemId>) -> HashMap<ItemId, Vec<Dynamic>> {
        items
            .into_iter()
            .map(|item| {
                let values = self.get_all(&item).into_iter().cloned().collect();
                (item, values)
            })
            .collect()
    }

    /// Drops every item rejected by `keep`.
    pub fn retain(&mut self, keep: impl Fn(&ItemId) -> bool) {
        self.slots.retain(|item, _| keep(item));
    }
}
