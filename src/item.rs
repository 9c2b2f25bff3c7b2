//! Item identities exchanged between build steps.
//!
//! Every piece of data that flows through a [`Chain`](crate::Chain) is keyed
//! by an [`ItemId`]: the Rust type of the value together with a
//! [`Cardinality`] tag. Which types may be used, and with which cardinality,
//! is decided at compile time through the [`SimpleItem`] and [`MultiItem`]
//! marker traits, so the chain never needs to inspect a value to know how to
//! store it.

use std::any::{Any, TypeId, type_name};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use bitflags::bitflags;

/// A value that is produced at most once per execution.
///
/// Types implementing this trait can be used both as [`Cardinality::Simple`]
/// and as [`Cardinality::Weak`] items.
pub trait SimpleItem: Send + Sync + 'static {}

/// A value that can be contributed by any number of steps.
///
/// When read back, values are ordered by the ordinal of the producing step.
/// Values contributed by the same step keep their insertion order, unless the
/// type provides a natural order through [`MultiItem::natural_order`].
///
/// ```rust
/// use std::cmp::Ordering;
/// use buildchain::MultiItem;
///
/// #[derive(PartialEq, Eq, PartialOrd, Ord)]
/// struct Feature(&'static str);
///
/// impl MultiItem for Feature {
///     fn natural_order(&self, other: &Self) -> Option<Ordering> {
///         Some(self.cmp(other))
///     }
/// }
/// ```
pub trait MultiItem: Send + Sync + 'static {
    /// Orders two values contributed by the same step. `None` keeps the
    /// insertion order.
    fn natural_order(&self, _other: &Self) -> Option<Ordering> {
        None
    }
}

/// How many values an item can carry within a single execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Cardinality {
    /// Exactly one producer, at most one value.
    Simple,
    /// Any number of producers and values.
    Multi,
    /// A best-effort singleton. Producing it never forces the producer to be
    /// scheduled, and its absence is not an error.
    Weak,
}

type Erased = dyn Any + Send + Sync;

type CompareFn = fn(&Erased, &Erased) -> Option<Ordering>;

fn compare_multi<T: MultiItem>(a: &Erased, b: &Erased) -> Option<Ordering> {
    let a = a.downcast_ref::<T>()?;
    let b = b.downcast_ref::<T>()?;
    a.natural_order(b)
}

/// Identifies a kind of item.
///
/// Two identities are equal when they refer to the same Rust type with the
/// same cardinality.
#[derive(Clone, Copy)]
pub struct ItemId {
    type_id: TypeId,
    name: &'static str,
    cardinality: Cardinality,
    compare: Option<CompareFn>,
}

impl ItemId {
    /// Identity of a simple item of type `T`.
    pub fn simple<T: SimpleItem>() -> Self {
        Self {
            type_id: TypeId::of::<T>(),
            name: type_name::<T>(),
            cardinality: Cardinality::Simple,
            compare: None,
        }
    }

    /// Identity of a weak item of type `T`.
    pub fn weak<T: SimpleItem>() -> Self {
        Self {
            type_id: TypeId::of::<T>(),
            name: type_name::<T>(),
            cardinality: Cardinality::Weak,
            compare: None,
        }
    }

    /// Identity of a multi item of type `T`.
    pub fn multi<T: MultiItem>() -> Self {
        Self {
            type_id: TypeId::of::<T>(),
            name: type_name::<T>(),
            cardinality: Cardinality::Multi,
            compare: Some(compare_multi::<T>),
        }
    }

    pub fn cardinality(&self) -> Cardinality {
        self.cardinality
    }

    /// Fully qualified name of the item type.
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_multi(&self) -> bool {
        self.cardinality == Cardinality::Multi
    }

    pub fn is_weak(&self) -> bool {
        self.cardinality == Cardinality::Weak
    }

    /// Orders two values of this item contributed by the same producer.
    pub(crate) fn order(&self, a: &Erased, b: &Erased) -> Ordering {
        self.compare
            .and_then(|compare| compare(a, b))
            .unwrap_or(Ordering::Equal)
    }
}

impl PartialEq for ItemId {
    fn eq(&self, other: &Self) -> bool {
        self.type_id == other.type_id && self.cardinality == other.cardinality
    }
}

impl Eq for ItemId {}

impl Hash for ItemId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.type_id.hash(state);
        self.cardinality.hash(state);
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.cardinality {
            Cardinality::Simple => write!(f, "{}", self.name),
            Cardinality::Multi => write!(f, "multi {}", self.name),
            Cardinality::Weak => write!(f, "weak {}", self.name),
        }
    }
}

impl fmt::Debug for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ItemId({self})")
    }
}

bitflags! {
    /// Modifiers attached to a produce declaration.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ProduceFlags: u8 {
        /// The producer gives way to any concrete producer of the same
        /// simple item.
        const OVERRIDABLE = 1 << 0;
        /// Producing the item does not pull the step into the chain. The
        /// step is still ordered before consumers when it is live.
        const WEAK = 1 << 1;
    }
}

bitflags! {
    /// Modifiers attached to a consume declaration.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ConsumeFlags: u8 {
        /// A simple item that may have no producer at all.
        const OPTIONAL = 1 << 0;
    }
}
