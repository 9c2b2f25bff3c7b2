use std::panic::Location;
use std::sync::Arc;

use indexmap::{IndexMap, IndexSet};

use crate::chain::Chain;
use crate::core::{Action, Options};
use crate::error::{ChainBuildError, StepRef};
use crate::executor::StepContext;
use crate::graph;
use crate::item::{ConsumeFlags, ItemId, ProduceFlags};

/// Handle to a step registered on a [`ChainBuilder`]. Use
/// [`Chain::ordinal_of`] to find where it ended up after compilation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StepId(pub(crate) usize);

/// A step as it was declared, before producer resolution and pruning.
pub(crate) struct StepDecl {
    pub name: Box<str>,
    pub location: &'static Location<'static>,
    pub consumes: IndexMap<ItemId, ConsumeFlags>,
    pub produces: IndexMap<ItemId, ProduceFlags>,
    pub always_run: bool,
    pub action: Action,
}

impl StepDecl {
    pub fn step_ref(&self) -> StepRef {
        StepRef {
            name: self.name.clone(),
            location: self.location,
        }
    }
}

/// Installs a group of related steps into a builder.
///
/// Extensions implement this to contribute their steps, initial and final
/// items without the host knowing what they are.
///
/// ```rust
/// use buildchain::{BuildProvider, ChainBuilder, InitialValues, ItemId, SimpleItem};
///
/// struct Banner(&'static str);
/// impl SimpleItem for Banner {}
///
/// struct BannerProvider;
///
/// impl BuildProvider for BannerProvider {
///     fn install_into(&self, builder: &mut ChainBuilder) {
///         builder.add_final(ItemId::simple::<Banner>());
///         builder
///             .step("banner")
///             .produces(ItemId::simple::<Banner>())
///             .run(|ctx| Ok(ctx.produce(Banner("hello"))?));
///     }
/// }
///
/// let mut builder = ChainBuilder::new();
/// builder.add_provider(BannerProvider);
///
/// let result = builder.build().unwrap().execute(InitialValues::new()).unwrap();
/// assert_eq!(result.consume::<Banner>().unwrap().0, "hello");
/// ```
pub trait BuildProvider {
    fn install_into(&self, builder: &mut ChainBuilder);

    /// Label used in logs and by [`ChainBuilder::providers`].
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

impl<P: BuildProvider + ?Sized> BuildProvider for Box<P> {
    fn install_into(&self, builder: &mut ChainBuilder) {
        (**self).install_into(builder);
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

/// Collects build steps and compiles them into a [`Chain`].
///
/// The builder only accumulates declarations; nothing is validated until
/// [`ChainBuilder::build`] is called, which consumes the builder.
///
/// ```rust
/// use buildchain::{ChainBuilder, InitialValues, ItemId, SimpleItem};
///
/// struct Source(String);
/// impl SimpleItem for Source {}
///
/// struct Length(usize);
/// impl SimpleItem for Length {}
///
/// let mut builder = ChainBuilder::new();
/// builder
///     .add_initial(ItemId::simple::<Source>())
///     .add_final(ItemId::simple::<Length>());
///
/// builder
///     .step("measure")
///     .consumes(ItemId::simple::<Source>())
///     .produces(ItemId::simple::<Length>())
///     .run(|ctx| {
///         let source = ctx.consume::<Source>()?;
///         ctx.produce(Length(source.0.len()))?;
///         Ok(())
///     });
///
/// let chain = builder.build().unwrap();
/// let result = chain
///     .execute(InitialValues::new().simple(Source("hello".into())))
///     .unwrap();
///
/// assert_eq!(result.consume::<Length>().unwrap().0, 5);
/// ```
#[derive(Default)]
pub struct ChainBuilder {
    pub(crate) steps: Vec<StepDecl>,
    pub(crate) initial: IndexSet<ItemId>,
    pub(crate) finals: IndexSet<ItemId>,
    pub(crate) priority: IndexSet<ItemId>,
    pub(crate) providers: Vec<Box<str>>,
    pub(crate) options: Options,
}

impl ChainBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: Options) -> Self {
        Self {
            options,
            ..Self::default()
        }
    }

    /// Starts declaring a step. The step is registered once
    /// [`StepDef::run`] supplies its action.
    #[track_caller]
    pub fn step(&mut self, name: impl Into<String>) -> StepDef<'_> {
        StepDef {
            builder: self,
            name: name.into().into_boxed_str(),
            location: Location::caller(),
            consumes: IndexMap::new(),
            produces: IndexMap::new(),
            always_run: false,
        }
    }

    /// Declares an item supplied by the caller when the chain is executed.
    pub fn add_initial(&mut self, item: ItemId) -> &mut Self {
        self.initial.insert(item);
        self
    }

    /// Declares an item the chain has to make available in the result.
    pub fn add_final(&mut self, item: ItemId) -> &mut Self {
        self.finals.insert(item);
        self
    }

    /// Hints that the producers of `item`, and everything they depend on,
    /// should run as early as the dependency order allows. Earlier hints
    /// take precedence over later ones.
    pub fn add_priority_item(&mut self, item: ItemId) -> &mut Self {
        self.priority.insert(item);
        self
    }

    /// Lets `provider` install its steps right away.
    pub fn add_provider(&mut self, provider: impl BuildProvider) -> &mut Self {
        let name = provider.name().to_owned().into_boxed_str();
        let before = self.steps.len();

        provider.install_into(self);

        tracing::debug!(
            provider = &*name,
            steps = self.steps.len() - before,
            "installed build provider"
        );
        self.providers.push(name);
        self
    }

    /// Installs every provider in iteration order.
    pub fn add_providers<P, I>(&mut self, providers: I) -> &mut Self
    where
        P: BuildProvider,
        I: IntoIterator<Item = P>,
    {
        for provider in providers {
            self.add_provider(provider);
        }
        self
    }

    /// Names of the installed providers, in installation order.
    pub fn providers(&self) -> &[Box<str>] {
        &self.providers
    }

    /// Validates the declarations and compiles them into an immutable chain.
    ///
    /// Every problem found is reported in the returned error, no partial
    /// chain is ever produced.
    pub fn build(self) -> Result<Chain, ChainBuildError> {
        let chain = graph::compile(self.steps, self.initial, self.finals, &self.priority)?;

        if let Some(path) = &self.options.graph_output {
            match crate::utils::write_graph(path, &chain) {
                Ok(()) => tracing::debug!(%path, "wrote chain graph"),
                Err(err) => tracing::warn!(%path, "failed to write chain graph: {err}"),
            }
        }

        Ok(chain)
    }
}

/// A step under construction.
#[must_use = "a step is only added to the chain once `run` is called"]
pub struct StepDef<'a> {
    builder: &'a mut ChainBuilder,
    name: Box<str>,
    location: &'static Location<'static>,
    consumes: IndexMap<ItemId, ConsumeFlags>,
    produces: IndexMap<ItemId, ProduceFlags>,
    always_run: bool,
}

impl<'a> StepDef<'a> {
    pub fn consumes(self, item: ItemId) -> Self {
        self.consumes_with(item, ConsumeFlags::empty())
    }

    /// Declares a consumed item. Repeated declarations merge their flags.
    pub fn consumes_with(mut self, item: ItemId, flags: ConsumeFlags) -> Self {
        *self.consumes.entry(item).or_default() |= flags;
        self
    }

    pub fn produces(self, item: ItemId) -> Self {
        self.produces_with(item, ProduceFlags::empty())
    }

    /// Declares a produced item. Repeated declarations merge their flags.
    pub fn produces_with(mut self, item: ItemId, flags: ProduceFlags) -> Self {
        *self.produces.entry(item).or_default() |= flags;
        self
    }

    /// Keeps the step in the chain even if nothing consumes what it
    /// produces.
    pub fn always_run(mut self) -> Self {
        self.always_run = true;
        self
    }

    /// Supplies the action and registers the step.
    pub fn run<F>(self, action: F) -> StepId
    where
        F: Fn(&StepContext<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = StepId(self.builder.steps.len());

        self.builder.steps.push(StepDecl {
            name: self.name,
            location: self.location,
            consumes: self.consumes,
            produces: self.produces,
            always_run: self.always_run,
            action: Arc::new(action),
        });

        id
    }
}
