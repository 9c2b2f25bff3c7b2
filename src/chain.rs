//! The compiled, immutable build chain.
use std::fmt;
use std::panic::Location;

use indexmap::{IndexMap, IndexSet};
use serde::Serialize;

use crate::builder::StepId;
use crate::core::{Action, Options, Ordinal};
use crate::error::ExecutionError;
use crate::executor::{self, InitialValues};
use crate::item::{ConsumeFlags, ItemId, ProduceFlags};
use crate::result::BuildResult;

/// Whether a produce declaration survived producer resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ProduceState {
    /// Values produced by the step are stored.
    Effective,
    /// A concrete producer won over this overridable declaration, values are
    /// silently dropped.
    Overridden,
}

/// A live step of a compiled chain.
pub struct StepInfo {
    pub(crate) name: Box<str>,
    pub(crate) location: &'static Location<'static>,
    pub(crate) ordinal: usize,
    pub(crate) consumes: IndexMap<ItemId, ConsumeFlags>,
    pub(crate) produces: IndexMap<ItemId, ProduceFlags>,
    pub(crate) overridden: IndexSet<ItemId>,
    /// Ordinals of the steps that have to complete first.
    pub(crate) dependencies: Vec<usize>,
    /// Ordinals of the steps waiting on this one.
    pub(crate) dependents: Vec<usize>,
    pub(crate) action: Action,
}

impl StepInfo {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Where the step was declared.
    pub fn location(&self) -> &'static Location<'static> {
        self.location
    }

    pub fn ordinal(&self) -> usize {
        self.ordinal
    }

    pub fn consumes(&self) -> impl Iterator<Item = (ItemId, ConsumeFlags)> + '_ {
        self.consumes.iter().map(|(item, flags)| (*item, *flags))
    }

    pub fn produces(&self) -> impl Iterator<Item = (ItemId, ProduceFlags)> + '_ {
        self.produces.iter().map(|(item, flags)| (*item, *flags))
    }

    pub fn dependencies(&self) -> &[usize] {
        &self.dependencies
    }

    pub(crate) fn consumes_item(&self, item: &ItemId) -> bool {
        self.consumes.contains_key(item)
    }

    pub(crate) fn consume_flags(&self, item: &ItemId) -> ConsumeFlags {
        self.consumes.get(item).copied().unwrap_or_default()
    }

    pub(crate) fn produce_state(&self, item: &ItemId) -> Option<ProduceState> {
        if self.overridden.contains(item) {
            Some(ProduceState::Overridden)
        } else if self.produces.contains_key(item) {
            Some(ProduceState::Effective)
        } else {
            None
        }
    }
}

impl fmt::Debug for StepInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepInfo")
            .field("name", &self.name)
            .field("ordinal", &self.ordinal)
            .field("consumes", &self.consumes)
            .field("produces", &self.produces)
            .field("dependencies", &self.dependencies)
            .finish_non_exhaustive()
    }
}

/// A validated, ordered pipeline of build steps.
///
/// A `Chain` is created by [`ChainBuilder::build`](crate::ChainBuilder::build)
/// and never changes afterwards. It can be executed any number of times,
/// including concurrently from several threads; every execution gets its own
/// item store.
pub struct Chain {
    pub(crate) steps: Vec<StepInfo>,
    pub(crate) initial: IndexSet<ItemId>,
    pub(crate) finals: IndexSet<ItemId>,
    /// Every item mapped to the sorted ordinals of its effective producers.
    pub(crate) producers: IndexMap<ItemId, Vec<Ordinal>>,
    /// Ordinal of each declared step, `None` when it was pruned.
    pub(crate) declared: Vec<Option<usize>>,
}

impl Chain {
    /// Live steps in execution order.
    pub fn steps(&self) -> &[StepInfo] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn initial_ids(&self) -> &IndexSet<ItemId> {
        &self.initial
    }

    pub fn final_ids(&self) -> &IndexSet<ItemId> {
        &self.finals
    }

    /// Ordinals of the producers of `item`, ascending, with
    /// [`Ordinal::Initial`] first when the caller supplies it.
    pub fn producers_of(&self, item: &ItemId) -> &[Ordinal] {
        self.producers.get(item).map(Vec::as_slice).unwrap_or_default()
    }

    /// Ordinal assigned to a declared step, or `None` if it was pruned.
    pub fn ordinal_of(&self, step: StepId) -> Option<usize> {
        self.declared.get(step.0).copied().flatten()
    }

    pub fn step(&self, name: &str) -> Option<&StepInfo> {
        self.steps.iter().find(|step| &*step.name == name)
    }

    /// Runs every step in ordinal order.
    pub fn execute(&self, initial: InitialValues) -> Result<BuildResult, ExecutionError> {
        executor::run_sequential(self, initial)
    }

    /// Runs steps that do not depend on each other concurrently on the rayon
    /// pool. Multi items are still ordered by producer ordinal.
    pub fn execute_parallel(&self, initial: InitialValues) -> Result<BuildResult, ExecutionError> {
        executor::run_parallel(self, initial)
    }

    /// Runs the chain sequentially or in parallel, according to `options`.
    pub fn execute_with(
        &self,
        initial: InitialValues,
        options: &Options,
    ) -> Result<BuildResult, ExecutionError> {
        if options.parallel {
            self.execute_parallel(initial)
        } else {
            self.execute(initial)
        }
    }

    /// A serializable description of the chain.
    pub fn plan(&self) -> ChainPlan {
        ChainPlan {
            steps: self
                .steps
                .iter()
                .map(|step| PlannedStep {
                    ordinal: step.ordinal,
                    name: step.name.to_string(),
                    consumes: step.consumes.keys().map(ToString::to_string).collect(),
                    produces: step
                        .produces
                        .keys()
                        .filter(|item| !step.overridden.contains(*item))
                        .map(ToString::to_string)
                        .collect(),
                    depends_on: step.dependencies.clone(),
                })
                .collect(),
            initial: self.initial.iter().map(ToString::to_string).collect(),
            finals: self.finals.iter().map(ToString::to_string).collect(),
        }
    }
}

impl fmt::Debug for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chain")
            .field("steps", &self.steps)
            .field("initial", &self.initial)
            .field("finals", &self.finals)
            .finish()
    }
}

fn escape(text: &str) -> String {
    text.replace('"', "\\\"")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Renders the chain as a Mermaid flowchart.
impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "graph LR")?;
        writeln!(f, "    Initial[Initial]")?;

        for step in &self.steps {
            writeln!(
                f,
                "    {}[\"{}: {}\"]",
                step.ordinal,
                step.ordinal,
                escape(&step.name)
            )?;
        }

        writeln!(f, "    Final[Final]")?;

        let node = |ordinal: &Ordinal| match ordinal {
            Ordinal::Initial => "Initial".to_string(),
            Ordinal::Step(n) => n.to_string(),
        };

        for step in &self.steps {
            for item in step.consumes.keys() {
                for producer in self.producers_of(item) {
                    writeln!(
                        f,
                        "    {} -- \"{}\" --> {}",
                        node(producer),
                        escape(&item.to_string()),
                        step.ordinal
                    )?;
                }
            }
        }

        for item in &self.finals {
            for producer in self.producers_of(item) {
                writeln!(
                    f,
                    "    {} -- \"{}\" --> Final",
                    node(producer),
                    escape(&item.to_string())
                )?;
            }
        }

        Ok(())
    }
}

/// A serializable description of a compiled chain, in execution order.
#[derive(Debug, Clone, Serialize)]
pub struct ChainPlan {
    pub steps: Vec<PlannedStep>,
    pub initial: Vec<String>,
    #[serde(rename = "final")]
    pub finals: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlannedStep {
    pub ordinal: usize,
    pub name: String,
    pub consumes: Vec<String>,
    pub produces: Vec<String>,
    pub depends_on: Vec<usize>,
}

impl ChainPlan {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use crate::{ChainBuilder, ItemId, MultiItem, SimpleItem};

    struct Source;
    impl SimpleItem for Source {}

    struct Bundle;
    impl SimpleItem for Bundle {}

    struct Note;
    impl MultiItem for Note {}

    fn sample() -> crate::Chain {
        let mut builder = ChainBuilder::new();
        builder
            .add_initial(ItemId::simple::<Source>())
            .add_final(ItemId::simple::<Bundle>());

        builder
            .step("annotate")
            .consumes(ItemId::simple::<Source>())
            .produces(ItemId::multi::<Note>())
            .run(|ctx| Ok(ctx.produce_multi(Note)?));

        builder
            .step("bundle")
            .consumes(ItemId::simple::<Source>())
            .consumes(ItemId::multi::<Note>())
            .produces(ItemId::simple::<Bundle>())
            .run(|ctx| Ok(ctx.produce(Bundle)?));

        builder.build().unwrap()
    }

    #[test]
    fn test_render_mermaid() {
        let chain = sample();
        let text = chain.to_string();

        assert!(text.starts_with("graph LR\n"));
        assert!(text.contains("0[\"0: annotate\"]"));
        assert!(text.contains("1[\"1: bundle\"]"));
        assert!(text.contains("Initial -- \""));
        assert!(text.contains("0 -- \"multi "));
        assert!(text.contains("--> 1"));
        assert!(text.contains("1 -- \""));
        assert!(text.contains("--> Final"));
    }

    #[test]
    fn test_plan_json() {
        let chain = sample();
        let plan = chain.plan();

        assert_eq!(plan.steps.len(), 2);
        assert_eq!(plan.steps[1].name, "bundle");
        assert_eq!(plan.steps[1].depends_on, vec![0]);

        let json = chain.plan().to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["steps"][0]["name"], "annotate");
        assert_eq!(value["final"].as_array().unwrap().len(), 1);
        assert!(value["initial"][0].as_str().unwrap().ends_with("Source"));
    }

    #[test]
    fn test_lookup_helpers() {
        let chain = sample();
        assert_eq!(chain.len(), 2);
        assert!(!chain.is_empty());
        assert_eq!(chain.step("bundle").unwrap().ordinal(), 1);
        assert!(chain.step("missing").is_none());
        assert_eq!(
            chain.producers_of(&ItemId::simple::<Source>()),
            &[crate::Ordinal::Initial]
        );
        assert_eq!(
            chain.producers_of(&ItemId::multi::<Note>()),
            &[crate::Ordinal::Step(0)]
        );
    }
}
