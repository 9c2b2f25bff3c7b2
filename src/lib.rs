#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod builder;
mod chain;
mod core;
pub mod error;
mod executor;
mod graph;
mod item;
mod result;
mod store;
mod utils;

pub use crate::builder::{BuildProvider, ChainBuilder, StepDef, StepId};
pub use crate::chain::{Chain, ChainPlan, PlannedStep, StepInfo};
pub use crate::core::{Options, Ordinal};
pub use crate::error::{AccessError, BuildIssue, ChainBuildError, ExecutionError, ResultError};
pub use crate::executor::{Diagnostics, InitialValues, StepContext, StepExecution};
pub use crate::item::{Cardinality, ConsumeFlags, ItemId, MultiItem, ProduceFlags, SimpleItem};
pub use crate::result::BuildResult;
#[cfg(feature = "logging")]
pub use crate::utils::init_logging;
