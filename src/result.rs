use std::fmt;

use indexmap::IndexSet;

use crate::core::Dynamic;
use crate::error::ResultError;
use crate::executor::Diagnostics;
use crate::item::{ItemId, MultiItem, SimpleItem};
use crate::store::ItemStore;

/// The outcome of a successful execution.
///
/// Only the chain's final items can be read back; everything else produced
/// along the way is dropped once the execution completes.
pub struct BuildResult {
    store: ItemStore,
    finals: IndexSet<ItemId>,
    diagnostics: Diagnostics,
}

impl BuildResult {
    pub(crate) fn new(mut store: ItemStore, finals: IndexSet<ItemId>, diagnostics: Diagnostics) -> Self {
        store.retain(|item| finals.contains(item));
        Self {
            store,
            finals,
            diagnostics,
        }
    }

    fn values(&self, item: ItemId) -> Result<Vec<&Dynamic>, ResultError> {
        if !self.finals.contains(&item) {
            return Err(ResultError::NotFinal(item));
        }
        Ok(self.store.get_all(&item))
    }

    /// Reads a final simple item.
    pub fn consume<T: SimpleItem>(&self) -> Result<&T, ResultError> {
        let item = ItemId::simple::<T>();
        self.values(item)?
            .into_iter()
            .next()
            .and_then(|value| value.downcast_ref::<T>())
            .ok_or(ResultError::Missing(item))
    }

    /// Reads a final weak item, which may legitimately be absent.
    pub fn consume_weak<T: SimpleItem>(&self) -> Result<Option<&T>, ResultError> {
        Ok(self
            .values(ItemId::weak::<T>())?
            .into_iter()
            .next()
            .and_then(|value| value.downcast_ref::<T>()))
    }

    /// Reads every value of a final multi item, ordered by producer.
    pub fn consume_multi<T: MultiItem>(&self) -> Result<Vec<&T>, ResultError> {
        Ok(self
            .values(ItemId::multi::<T>())?
            .into_iter()
            .filter_map(|value| value.downcast_ref::<T>())
            .collect())
    }

    pub fn final_ids(&self) -> &IndexSet<ItemId> {
        &self.finals
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }
}

impl fmt::Debug for BuildResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuildResult")
            .field("finals", &self.finals)
            .field("diagnostics", &self.diagnostics)
            .finish_non_exhaustive()
    }
}
