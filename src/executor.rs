//! Running compiled chains.
//!
//! Every execution owns a fresh [`ItemStore`]. Before a step runs, the values
//! of the items it consumes are copied out of the store into its
//! [`StepContext`]; once the action returns, the values it produced are
//! merged back under the step's ordinal. Multi items are therefore ordered
//! by ordinal no matter in which order steps actually finish.

mod context;
mod diagnostics;

use std::collections::{BTreeMap, HashMap};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::mpsc::{Receiver, TryRecvError, channel};
use std::time::Instant;

use tracing::Span;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::chain::{Chain, StepInfo};
use crate::core::{Dynamic, Ordinal};
use crate::error::ExecutionError;
use crate::item::{Cardinality, ItemId, MultiItem, SimpleItem};
use crate::result::BuildResult;
use crate::store::ItemStore;

pub use context::StepContext;
pub use diagnostics::{Diagnostics, StepExecution};

type Outbox = Vec<(ItemId, Dynamic)>;

/// Completion report sent by a spawned step: ordinal, outcome, timing.
type Completion = (usize, Result<Outbox, ExecutionError>, StepExecution);

/// Values supplied by the caller for the chain's initial items.
///
/// ```rust
/// use buildchain::{InitialValues, SimpleItem};
///
/// struct ArtifactPath(String);
/// impl SimpleItem for ArtifactPath {}
///
/// let initial = InitialValues::new().simple(ArtifactPath("app.jar".into()));
/// ```
#[derive(Default)]
pub struct InitialValues {
    values: Vec<(ItemId, Dynamic)>,
}

impl InitialValues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn simple<T: SimpleItem>(mut self, value: T) -> Self {
        self.values.push((ItemId::simple::<T>(), Arc::new(value)));
        self
    }

    pub fn weak<T: SimpleItem>(mut self, value: T) -> Self {
        self.values.push((ItemId::weak::<T>(), Arc::new(value)));
        self
    }

    /// Adds one value to a multi item. May be called repeatedly.
    pub fn multi<T: MultiItem>(mut self, value: T) -> Self {
        self.values.push((ItemId::multi::<T>(), Arc::new(value)));
        self
    }
}

/// Creates the store of a new execution, holding the initial values.
fn seed(chain: &Chain, initial: InitialValues) -> Result<ItemStore, ExecutionError> {
    let mut store = ItemStore::new();

    for (item, value) in initial.values {
        if !chain.initial.contains(&item) {
            return Err(ExecutionError::UndeclaredInitial(item));
        }
        store
            .insert(item, Ordinal::Initial, value)
            .map_err(ExecutionError::DuplicateInitial)?;
    }

    for item in &chain.initial {
        if item.cardinality() == Cardinality::Simple && !store.contains(item) {
            return Err(ExecutionError::MissingInitial(*item));
        }
    }

    Ok(store)
}

fn progress_span(total: usize) -> Span {
    let span = tracing::info_span!("execute", steps = total);
    span.pb_set_length(total as u64);
    span.pb_set_style(&crate::utils::get_style_build());
    span.pb_set_message("Running build steps...");
    span
}

/// Runs one step action, isolating panics.
fn run_step(
    parent: &Span,
    step: &StepInfo,
    inputs: HashMap<ItemId, Vec<Dynamic>>,
) -> (Result<Outbox, ExecutionError>, StepExecution) {
    let span = tracing::info_span!(parent: parent, "step", name = step.name(), ordinal = step.ordinal());
    span.pb_set_style(&crate::utils::get_style_step());
    span.pb_set_message(&format!("Running {}", step.name()));
    let _enter = span.enter();

    let context = StepContext::new(step, inputs, span.clone());
    let start = Instant::now();

    // The context only lives for this call and is inspected afterwards, a
    // panic cannot leave shared state half-written.
    let outcome = catch_unwind(AssertUnwindSafe(|| (step.action)(&context)));

    let duration = start.elapsed();
    let (outbox, violation) = context.finish();

    let result = match (violation, outcome) {
        (Some(source), _) => Err(ExecutionError::Access {
            step: step.name.clone(),
            source,
        }),
        (None, Ok(Ok(()))) => Ok(outbox),
        (None, Ok(Err(source))) => Err(ExecutionError::Step {
            step: step.name.clone(),
            source,
        }),
        (None, Err(panic)) => {
            let msg = if let Some(s) = panic.downcast_ref::<&str>() {
                format!("Step panicked: {s}")
            } else if let Some(s) = panic.downcast_ref::<String>() {
                format!("Step panicked: {s}")
            } else {
                String::from("Step panicked with unknown payload")
            };

            Err(ExecutionError::Step {
                step: step.name.clone(),
                source: anyhow::anyhow!(msg),
            })
        }
    };

    match &result {
        Ok(outbox) => tracing::debug!(produced = outbox.len(), ?duration, "step finished"),
        Err(err) => tracing::error!("{err}"),
    }

    let execution = StepExecution {
        name: step.name.clone(),
        start,
        duration,
    };

    (result, execution)
}

fn merge(store: &mut ItemStore, step: &StepInfo, outbox: Outbox) -> Result<(), ExecutionError> {
    for (item, value) in outbox {
        store
            .insert(item, Ordinal::Step(step.ordinal), value)
            .map_err(|item| ExecutionError::AlreadyProduced {
                step: step.name.clone(),
                item,
            })?;
    }
    Ok(())
}

/// Runs every step in ordinal order on the calling thread.
pub(crate) fn run_sequential(
    chain: &Chain,
    initial: InitialValues,
) -> Result<BuildResult, ExecutionError> {
    let mut store = seed(chain, initial)?;

    let root = progress_span(chain.len());
    let _enter = root.enter();

    let mut execution_times = BTreeMap::new();

    for step in &chain.steps {
        let inputs = store.snapshot(step.consumes.keys().copied());
        let (result, execution) = run_step(&root, step, inputs);
        execution_times.insert(step.ordinal, execution);

        merge(&mut store, step, result?)?;
        root.pb_inc(1);
    }

    tracing::info!(steps = chain.len(), "build complete");
    Ok(BuildResult::new(
        store,
        chain.finals.clone(),
        Diagnostics { execution_times },
    ))
}

/// Runs the chain on the rayon pool. Steps are spawned as soon as every
/// step they depend on has completed.
///
/// The algorithm works as follows:
/// 1. Every step starts with a counter of unfinished dependencies.
/// 2. Steps whose counter is zero are spawned, each with a snapshot of the
///    values it consumes.
/// 3. The calling thread waits on a result channel. On a pool worker it keeps
///    running queued jobs while it waits. When a step completes,
///    its values are merged into the store and the counters of its
///    dependents are decremented.
/// 4. Dependents whose counter reaches zero are spawned.
/// 5. The loop stops when every step completed, or at the first failure.
pub(crate) fn run_parallel(
    chain: &Chain,
    initial: InitialValues,
) -> Result<BuildResult, ExecutionError> {
    let mut store = seed(chain, initial)?;

    let total = chain.len();
    let root = progress_span(total);
    let _enter = root.enter();

    let mut pending: Vec<usize> = chain
        .steps
        .iter()
        .map(|step| step.dependencies.len())
        .collect();
    let mut execution_times = BTreeMap::new();
    let mut completed = 0;

    if total > 0 {
        rayon::in_place_scope(|s| -> Result<(), ExecutionError> {
            let (sender, receiver) = channel::<Completion>();

            let spawn_step = |store: &ItemStore, ordinal: usize| {
                let step = &chain.steps[ordinal];
                let inputs = store.snapshot(step.consumes.keys().copied());
                let sender = sender.clone();
                let parent = root.clone();

                s.spawn(move |_| {
                    let (result, execution) = run_step(&parent, step, inputs);
                    // the scheduler may already have stopped on another failure
                    let _ = sender.send((ordinal, result, execution));
                });
            };

            // Seed steps without dependencies
            for (ordinal, count) in pending.iter().enumerate() {
                if *count == 0 {
                    spawn_step(&store, ordinal);
                }
            }

            // Scheduler loop
            while completed < total {
                let (ordinal, result, execution) = next_completion(&receiver)?;

                let step = &chain.steps[ordinal];
                execution_times.insert(ordinal, execution);
                merge(&mut store, step, result?)?;
                completed += 1;
                root.pb_inc(1);

                // Unlock dependents
                for &next in &step.dependents {
                    pending[next] -= 1;
                    if pending[next] == 0 {
                        spawn_step(&store, next);
                    }
                }
            }

            Ok(())
        })?;
    }

    tracing::info!(steps = total, "build complete");
    Ok(BuildResult::new(
        store,
        chain.finals.clone(),
        Diagnostics { execution_times },
    ))
}

/// Waits for the next finished step.
///
/// Inside a rayon worker the spawned steps sit on this worker's own deque,
/// so blocking on the channel would starve them. The worker runs pending
/// jobs instead until a completion arrives.
fn next_completion(receiver: &Receiver<Completion>) -> Result<Completion, ExecutionError> {
    if rayon::current_thread_index().is_none() {
        return receiver.recv().map_err(|_| ExecutionError::Scheduler);
    }

    loop {
        match receiver.try_recv() {
            Ok(completion) => return Ok(completion),
            Err(TryRecvError::Disconnected) => return Err(ExecutionError::Scheduler),
            Err(TryRecvError::Empty) => {
                if !matches!(rayon::yield_now(), Some(rayon::Yield::Executed)) {
                    std::thread::yield_now();
                }
            }
        }
    }
}
