use std::fmt;
use std::panic::Location;

use thiserror::Error;

use crate::item::ItemId;

/// A step as it was declared on the builder, used to point at the offending
/// declaration in build issues.
#[derive(Debug, Clone)]
pub struct StepRef {
    pub name: Box<str>,
    pub location: &'static Location<'static>,
}

impl fmt::Display for StepRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "'{}' (declared at {})", self.name, self.location)
    }
}

/// One edge of a dependency cycle: `step` produced `item` for the next link.
#[derive(Debug, Clone)]
pub struct CycleLink {
    pub step: StepRef,
    pub item: ItemId,
}

fn list(steps: &[StepRef]) -> String {
    steps
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

fn cycle(path: &[CycleLink]) -> String {
    let mut acc = String::new();
    for link in path {
        acc.push_str(&format!("\n\t{} produced {}\n\t  to", link.step, link.item));
    }
    if let Some(first) = path.first() {
        acc.push_str(&format!(" {}", first.step));
    }
    acc
}

fn superseded(overridden: &[StepRef]) -> String {
    if overridden.is_empty() {
        String::new()
    } else {
        format!(
            "; the overridable producer(s) {} would have been unused",
            list(overridden)
        )
    }
}

/// A single problem found while compiling a chain.
#[derive(Debug, Clone, Error)]
pub enum BuildIssue {
    #[error("Cycle detected:{}", cycle(.path))]
    Cycle { path: Vec<CycleLink> },

    #[error(
        "Multiple producers of item {item}: {}{}",
        list(.producers),
        superseded(.overridden)
    )]
    DuplicateProducers {
        item: ItemId,
        producers: Vec<StepRef>,
        overridden: Vec<StepRef>,
    },

    #[error(
        "Multiple overridable producers of item {item} and no concrete implementation chosen: {}",
        list(.producers)
    )]
    AllOverridable {
        item: ItemId,
        producers: Vec<StepRef>,
    },

    #[error("Item {item} cannot be produced by step {step}: it is an initial item")]
    InitialProduced { item: ItemId, step: StepRef },

    #[error("No producers for required item {item}, consumed by step {step}")]
    UnsatisfiedConsumer { item: ItemId, step: StepRef },

    #[error("No producers for final item {item}")]
    MissingFinalProducer { item: ItemId },
}

/// Compiling a chain failed. Carries every issue that was found.
#[derive(Debug, Clone, Error)]
pub struct ChainBuildError {
    issues: Vec<BuildIssue>,
}

impl ChainBuildError {
    pub(crate) fn new(issues: Vec<BuildIssue>) -> Self {
        Self { issues }
    }

    pub fn issues(&self) -> &[BuildIssue] {
        &self.issues
    }
}

impl fmt::Display for ChainBuildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.issues.as_slice() {
            [issue] => write!(f, "Failed to build chain: {issue}"),
            issues => {
                write!(f, "Failed to build chain, {} issues found:", issues.len())?;
                for issue in issues {
                    write!(f, "\n  - {issue}")?;
                }
                Ok(())
            }
        }
    }
}

/// A step touched an item outside of its declared contract.
#[derive(Debug, Clone, Error)]
pub enum AccessError {
    #[error("item {0} was not declared as consumed")]
    NotConsumed(ItemId),

    #[error("item {0} was not declared as produced")]
    NotProduced(ItemId),

    #[error("simple item {0} was already produced")]
    AlreadyProduced(ItemId),

    #[error("item {0} has no value")]
    Missing(ItemId),
}

/// Running a compiled chain failed. No result is available.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("Step '{step}' failed:\n{source}")]
    Step {
        step: Box<str>,
        source: anyhow::Error,
    },

    #[error("Step '{step}' broke its declared contract: {source}")]
    Access { step: Box<str>, source: AccessError },

    #[error("Step '{step}' produced simple item {item} which already has a value")]
    AlreadyProduced { step: Box<str>, item: ItemId },

    #[error("Value supplied for item {0} which is not declared initial")]
    UndeclaredInitial(ItemId),

    #[error("No value supplied for initial item {0}")]
    MissingInitial(ItemId),

    #[error("More than one value supplied for initial item {0}")]
    DuplicateInitial(ItemId),

    #[error("Step scheduler stopped before all steps completed")]
    Scheduler,
}

impl ExecutionError {
    /// Name of the step the error is attributed to, if any.
    pub fn step(&self) -> Option<&str> {
        match self {
            ExecutionError::Step { step, .. }
            | ExecutionError::Access { step, .. }
            | ExecutionError::AlreadyProduced { step, .. } => Some(step),
            _ => None,
        }
    }
}

/// Reading a finished build failed.
#[derive(Debug, Clone, Error)]
pub enum ResultError {
    #[error("item {0} is not declared final")]
    NotFinal(ItemId),

    #[error("final item {0} has no value")]
    Missing(ItemId),
}
