use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use crate::chain::{ProduceState, StepInfo};
use crate::core::{Dynamic, Ordinal};
use crate::error::AccessError;
use crate::item::{ConsumeFlags, ItemId, MultiItem, SimpleItem};

/// The context passed to every step action.
///
/// A `StepContext` only exposes the items the step declared. Reading an item
/// that was not declared as consumed, or producing one that was not declared
/// as produced, returns an [`AccessError`] and fails the execution even if
/// the action discards the error.
///
/// The context is `Sync`, so an action may hand it to rayon tasks of its own
/// and produce from them.
pub struct StepContext<'a> {
    step: &'a StepInfo,
    inputs: HashMap<ItemId, Vec<Dynamic>>,
    outbox: Mutex<Vec<(ItemId, Dynamic)>>,
    violation: Mutex<Option<AccessError>>,
    /// Tracing span assigned to this step.
    pub(crate) span: tracing::Span,
}

impl<'a> StepContext<'a> {
    pub(crate) fn new(
        step: &'a StepInfo,
        inputs: HashMap<ItemId, Vec<Dynamic>>,
        span: tracing::Span,
    ) -> Self {
        Self {
            step,
            inputs,
            outbox: Mutex::new(Vec::new()),
            violation: Mutex::new(None),
            span,
        }
    }

    /// Name the step was declared with.
    pub fn name(&self) -> &str {
        self.step.name()
    }

    /// Position of the step in the chain.
    pub fn ordinal(&self) -> Ordinal {
        Ordinal::Step(self.step.ordinal())
    }

    /// Tracing span covering this step's execution.
    pub fn span(&self) -> &tracing::Span {
        &self.span
    }

    /// Reads a simple item.
    pub fn consume<T: SimpleItem>(&self) -> Result<&T, AccessError> {
        let item = ItemId::simple::<T>();
        match self.first::<T>(item)? {
            Some(value) => Ok(value),
            None => {
                let err = AccessError::Missing(item);
                // an optional consume is allowed to come up empty
                if self.step.consume_flags(&item).contains(ConsumeFlags::OPTIONAL) {
                    Err(err)
                } else {
                    Err(self.violate(err))
                }
            }
        }
    }

    /// Reads a simple item declared with [`ConsumeFlags::OPTIONAL`].
    pub fn consume_optional<T: SimpleItem>(&self) -> Result<Option<&T>, AccessError> {
        self.first::<T>(ItemId::simple::<T>())
    }

    /// Reads a weak item. Its absence is not an error.
    pub fn consume_weak<T: SimpleItem>(&self) -> Result<Option<&T>, AccessError> {
        self.first::<T>(ItemId::weak::<T>())
    }

    /// Reads every value of a multi item, ordered by the producing ordinal.
    pub fn consume_multi<T: MultiItem>(&self) -> Result<Vec<&T>, AccessError> {
        let values = self.lookup(ItemId::multi::<T>())?;
        Ok(values.iter().map(downcast::<T>).collect())
    }

    /// Produces a simple item.
    pub fn produce<T: SimpleItem>(&self, value: T) -> Result<(), AccessError> {
        self.emit(ItemId::simple::<T>(), Arc::new(value))
    }

    /// Produces a weak item.
    pub fn produce_weak<T: SimpleItem>(&self, value: T) -> Result<(), AccessError> {
        self.emit(ItemId::weak::<T>(), Arc::new(value))
    }

    /// Contributes one value to a multi item.
    pub fn produce_multi<T: MultiItem>(&self, value: T) -> Result<(), AccessError> {
        self.emit(ItemId::multi::<T>(), Arc::new(value))
    }

    fn lookup(&self, item: ItemId) -> Result<&[Dynamic], AccessError> {
        if !self.step.consumes_item(&item) {
            return Err(self.violate(AccessError::NotConsumed(item)));
        }

        Ok(self.inputs.get(&item).map(Vec::as_slice).unwrap_or_default())
    }

    fn first<T: Send + Sync + 'static>(&self, item: ItemId) -> Result<Option<&T>, AccessError> {
        Ok(self.lookup(item)?.first().map(downcast::<T>))
    }

    fn emit(&self, item: ItemId, value: Dynamic) -> Result<(), AccessError> {
        match self.step.produce_state(&item) {
            None => Err(self.violate(AccessError::NotProduced(item))),
            Some(ProduceState::Overridden) => {
                tracing::debug!(
                    step = self.step.name(),
                    %item,
                    "ignoring value, a concrete producer overrides this step"
                );
                Ok(())
            }
            Some(ProduceState::Effective) => {
                let mut outbox = self.outbox.lock().unwrap_or_else(PoisonError::into_inner);

                if !item.is_multi() && outbox.iter().any(|(id, _)| *id == item) {
                    return Err(self.violate(AccessError::AlreadyProduced(item)));
                }

                outbox.push((item, value));
                Ok(())
            }
        }
    }

    fn violate(&self, err: AccessError) -> AccessError {
        self.violation
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_or_insert_with(|| err.clone());
        err
    }

    /// Values produced by the step, in production order, and the first
    /// contract violation if there was one.
    pub(crate) fn finish(self) -> (Vec<(ItemId, Dynamic)>, Option<AccessError>) {
        (
            self.outbox.into_inner().unwrap_or_else(PoisonError::into_inner),
            self.violation.into_inner().unwrap_or_else(PoisonError::into_inner),
        )
    }
}

fn downcast<T: Send + Sync + 'static>(value: &Dynamic) -> &T {
    value
        .downcast_ref::<T>()
        .expect("Type mismatch in item resolution")
}
