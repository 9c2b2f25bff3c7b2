//! Compilation of step declarations into a [`Chain`].
//!
//! Steps and items form a bipartite graph: a step points at the items it
//! produces, an item points at the steps consuming it. Compilation collapses
//! that into a step-only graph where an edge `A -> B` means "A produces
//! something B consumes", and then:
//!
//! 1. resolves competing producers of simple and weak items, dropping
//!    overridable producers in favour of a single concrete one;
//! 2. marks steps live by walking backwards from the final items (and from
//!    steps flagged with `always_run`), pruning everything else;
//! 3. rejects cycles among the live steps;
//! 4. orders live steps topologically, breaking ties by priority hints and
//!    then by declaration order;
//! 5. assigns ordinals and indexes the producers of every item.
//!
//! Every issue found along the way is collected, so a single failed build
//! reports as much as possible.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet, VecDeque};

use indexmap::{IndexMap, IndexSet};
use petgraph::Direction;
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{Dfs, EdgeRef, Reversed};

use crate::builder::StepDecl;
use crate::chain::{Chain, StepInfo};
use crate::core::Ordinal;
use crate::error::{BuildIssue, ChainBuildError, CycleLink};
use crate::item::{Cardinality, ConsumeFlags, ItemId, ProduceFlags};

/// Step graph over live steps. Nodes hold declaration indices, edges hold
/// the item that links producer to consumer.
type StepGraph = DiGraph<usize, ItemId>;

pub(crate) fn compile(
    decls: Vec<StepDecl>,
    initial: IndexSet<ItemId>,
    finals: IndexSet<ItemId>,
    priority: &IndexSet<ItemId>,
) -> Result<Chain, ChainBuildError> {
    let span = tracing::info_span!("chain_build", steps = decls.len());
    let _enter = span.enter();

    let mut issues = Vec::new();

    let producers = index_producers(&decls);
    let overridden = resolve_producers(&decls, &producers, &initial, &mut issues);

    // Producers that are not overridden, weak ones included.
    let effective = |item: &ItemId| -> Vec<usize> {
        producers
            .get(item)
            .into_iter()
            .flatten()
            .copied()
            .filter(|&i| !overridden[i].contains(item))
            .collect()
    };

    let live = mark_live(&decls, &initial, &finals, &effective, &mut issues);

    for (decl, _) in decls.iter().zip(&live).filter(|(_, live)| !**live) {
        tracing::debug!(step = %decl.name, "pruned step, nothing consumes its output");
    }

    let (graph, nodes) = build_graph(&decls, &live, &effective);

    for scc in tarjan_scc(&graph) {
        if scc.len() > 1 || graph.contains_edge(scc[0], scc[0]) {
            issues.push(BuildIssue::Cycle {
                path: find_cycle(&graph, &scc, &decls),
            });
        }
    }

    if !issues.is_empty() {
        return Err(ChainBuildError::new(issues));
    }

    let ranks = priority_ranks(&graph, &nodes, priority, &effective);
    let order = sort(&graph, &ranks);

    let mut declared = vec![None; decls.len()];
    for (ordinal, &i) in order.iter().enumerate() {
        declared[i] = Some(ordinal);
    }

    let ordinals_of = |node: NodeIndex, direction: Direction| -> Vec<usize> {
        let mut ordinals: Vec<usize> = graph
            .neighbors_directed(node, direction)
            .filter_map(|other| declared[graph[other]])
            .collect();
        ordinals.sort_unstable();
        ordinals
    };

    let mut slots: Vec<Option<StepDecl>> = decls.into_iter().map(Some).collect();
    let mut steps = Vec::with_capacity(order.len());

    for (ordinal, &i) in order.iter().enumerate() {
        let Some(decl) = slots[i].take() else {
            continue;
        };
        let Some(node) = nodes[i] else {
            continue;
        };

        steps.push(StepInfo {
            name: decl.name,
            location: decl.location,
            ordinal,
            consumes: decl.consumes,
            produces: decl.produces,
            overridden: overridden[i].clone(),
            dependencies: ordinals_of(node, Direction::Incoming),
            dependents: ordinals_of(node, Direction::Outgoing),
            action: decl.action,
        });
    }

    let producers = index_ordinals(&steps, &initial);

    tracing::info!(
        live = steps.len(),
        pruned = declared.iter().filter(|ordinal| ordinal.is_none()).count(),
        "compiled chain"
    );

    Ok(Chain {
        steps,
        initial,
        finals,
        producers,
        declared,
    })
}

/// Every produced item mapped to its producers, in declaration order.
fn index_producers(decls: &[StepDecl]) -> IndexMap<ItemId, Vec<usize>> {
    let mut producers: IndexMap<ItemId, Vec<usize>> = IndexMap::new();
    for (i, decl) in decls.iter().enumerate() {
        for item in decl.produces.keys() {
            producers.entry(*item).or_default().push(i);
        }
    }
    producers
}

/// Applies the single-producer rule to simple and weak items. Returns, for
/// every declared step, the items whose produce declaration was overridden
/// by a concrete producer.
fn resolve_producers(
    decls: &[StepDecl],
    producers: &IndexMap<ItemId, Vec<usize>>,
    initial: &IndexSet<ItemId>,
    issues: &mut Vec<BuildIssue>,
) -> Vec<IndexSet<ItemId>> {
    let mut overridden = vec![IndexSet::new(); decls.len()];

    for (item, list) in producers {
        if item.is_multi() {
            continue;
        }

        if initial.contains(item) {
            for &i in list {
                issues.push(BuildIssue::InitialProduced {
                    item: *item,
                    step: decls[i].step_ref(),
                });
            }
            continue;
        }

        let (overridable, concrete): (Vec<usize>, Vec<usize>) = list
            .iter()
            .copied()
            .partition(|&i| decls[i].produces[item].contains(ProduceFlags::OVERRIDABLE));

        match concrete.as_slice() {
            [] if overridable.len() > 1 => issues.push(BuildIssue::AllOverridable {
                item: *item,
                producers: overridable.iter().map(|&i| decls[i].step_ref()).collect(),
            }),
            [] => {}
            [winner] => {
                for &i in &overridable {
                    tracing::debug!(
                        step = %decls[i].name,
                        winner = %decls[*winner].name,
                        %item,
                        "dropping overridable produce"
                    );
                    overridden[i].insert(*item);
                }
            }
            _ => issues.push(BuildIssue::DuplicateProducers {
                item: *item,
                producers: concrete.iter().map(|&i| decls[i].step_ref()).collect(),
                overridden: overridable.iter().map(|&i| decls[i].step_ref()).collect(),
            }),
        }
    }

    overridden
}

/// Walks backwards from the final items and the `always_run` steps. Only
/// strong produce declarations pull a producer in.
fn mark_live(
    decls: &[StepDecl],
    initial: &IndexSet<ItemId>,
    finals: &IndexSet<ItemId>,
    effective: &impl Fn(&ItemId) -> Vec<usize>,
    issues: &mut Vec<BuildIssue>,
) -> Vec<bool> {
    let pulling = |item: &ItemId| -> Vec<usize> {
        if item.is_weak() {
            return Vec::new();
        }
        effective(item)
            .into_iter()
            .filter(|&i| !decls[i].produces[item].contains(ProduceFlags::WEAK))
            .collect()
    };

    let mut live = vec![false; decls.len()];
    let mut queue = VecDeque::new();

    for item in finals {
        let found = pulling(item);
        if found.is_empty() && !initial.contains(item) && !item.is_weak() {
            issues.push(BuildIssue::MissingFinalProducer { item: *item });
        }
        for i in found {
            visit(i, &mut live, &mut queue);
        }
    }

    for (i, decl) in decls.iter().enumerate() {
        if decl.always_run {
            visit(i, &mut live, &mut queue);
        }
    }

    while let Some(i) = queue.pop_front() {
        for (item, flags) in &decls[i].consumes {
            // initial simple items have no step producers to pull
            if initial.contains(item) && !item.is_multi() {
                continue;
            }

            let found = pulling(item);
            let required = item.cardinality() == Cardinality::Simple
                && !flags.contains(ConsumeFlags::OPTIONAL);

            if found.is_empty() && required {
                issues.push(BuildIssue::UnsatisfiedConsumer {
                    item: *item,
                    step: decls[i].step_ref(),
                });
            }

            for j in found {
                visit(j, &mut live, &mut queue);
            }
        }
    }

    live
}

fn visit(i: usize, live: &mut [bool], queue: &mut VecDeque<usize>) {
    if !live[i] {
        live[i] = true;
        queue.push_back(i);
    }
}

/// Connects every live producer to every live consumer of its items.
/// Parallel edges are collapsed, the first item wins the label.
fn build_graph(
    decls: &[StepDecl],
    live: &[bool],
    effective: &impl Fn(&ItemId) -> Vec<usize>,
) -> (StepGraph, Vec<Option<NodeIndex>>) {
    let mut graph = StepGraph::new();
    let mut nodes = vec![None; decls.len()];

    for (i, _) in live.iter().enumerate().filter(|(_, live)| **live) {
        nodes[i] = Some(graph.add_node(i));
    }

    for (consumer, decl) in decls.iter().enumerate() {
        let Some(to) = nodes[consumer] else {
            continue;
        };

        for item in decl.consumes.keys() {
            for producer in effective(item) {
                let Some(from) = nodes[producer] else {
                    continue;
                };
                if graph.find_edge(from, to).is_none() {
                    graph.add_edge(from, to, *item);
                }
            }
        }
    }

    (graph, nodes)
}

/// Extracts one concrete cycle from a strongly connected component, starting
/// at its earliest declared step.
fn find_cycle(graph: &StepGraph, scc: &[NodeIndex], decls: &[StepDecl]) -> Vec<CycleLink> {
    let members: HashSet<NodeIndex> = scc.iter().copied().collect();
    let Some(&start) = scc.iter().min_by_key(|node| graph[**node]) else {
        return Vec::new();
    };

    let mut path: Vec<(NodeIndex, ItemId)> = Vec::new();
    let mut seen: IndexMap<NodeIndex, usize> = IndexMap::new();
    let mut current = start;

    loop {
        if let Some(&position) = seen.get(&current) {
            path = path.split_off(position);
            break;
        }

        let Some(edge) = graph
            .edges(current)
            .filter(|edge| members.contains(&edge.target()))
            .min_by_key(|edge| graph[edge.target()])
        else {
            break;
        };

        seen.insert(current, path.len());
        path.push((current, *edge.weight()));
        current = edge.target();
    }

    path.into_iter()
        .map(|(node, item)| CycleLink {
            step: decls[graph[node]].step_ref(),
            item,
        })
        .collect()
}

/// For every node, the position of the earliest priority item whose
/// dependency closure contains it. Nodes outside every closure rank last.
fn priority_ranks(
    graph: &StepGraph,
    nodes: &[Option<NodeIndex>],
    priority: &IndexSet<ItemId>,
    effective: &impl Fn(&ItemId) -> Vec<usize>,
) -> Vec<usize> {
    let mut ranks = vec![usize::MAX; graph.node_count()];
    let reversed = Reversed(graph);

    for (rank, item) in priority.iter().enumerate() {
        for producer in effective(item) {
            let Some(start) = nodes[producer] else {
                continue;
            };

            let mut dfs = Dfs::new(reversed, start);
            while let Some(node) = dfs.next(reversed) {
                let slot = &mut ranks[node.index()];
                *slot = (*slot).min(rank);
            }
        }
    }

    ranks
}

/// Kahn's algorithm, always picking the ready step with the lowest
/// (priority rank, declaration index).
fn sort(graph: &StepGraph, ranks: &[usize]) -> Vec<usize> {
    let mut pending: Vec<usize> = graph
        .node_indices()
        .map(|node| graph.neighbors_directed(node, Direction::Incoming).count())
        .collect();

    let mut ready = BinaryHeap::new();
    for node in graph.node_indices() {
        if pending[node.index()] == 0 {
            ready.push(Reverse((ranks[node.index()], graph[node], node)));
        }
    }

    let mut order = Vec::with_capacity(graph.node_count());
    while let Some(Reverse((_, decl, node))) = ready.pop() {
        order.push(decl);

        for next in graph.neighbors_directed(node, Direction::Outgoing) {
            let count = &mut pending[next.index()];
            *count -= 1;
            if *count == 0 {
                ready.push(Reverse((ranks[next.index()], graph[next], next)));
            }
        }
    }

    order
}

/// Producing ordinals of every item, ascending, with the caller first for
/// initial items.
fn index_ordinals(steps: &[StepInfo], initial: &IndexSet<ItemId>) -> IndexMap<ItemId, Vec<Ordinal>> {
    let mut index: IndexMap<ItemId, Vec<Ordinal>> = IndexMap::new();

    for item in initial {
        index.entry(*item).or_default().push(Ordinal::Initial);
    }

    // steps are already in ordinal order
    for step in steps {
        for item in step.produces.keys() {
            if !step.overridden.contains(item) {
                index.entry(*item).or_default().push(Ordinal::Step(step.ordinal));
            }
        }
    }

    index
}

#[cfg(test)]
mod tests {
    use crate::error::BuildIssue;
    use crate::{Chain, ChainBuilder, ConsumeFlags, ItemId, MultiItem, ProduceFlags, SimpleItem};

    struct Input;
    impl SimpleItem for Input {}

    struct Config;
    impl SimpleItem for Config {}

    struct Output;
    impl SimpleItem for Output {}

    struct Extra;
    impl SimpleItem for Extra {}

    struct Message;
    impl MultiItem for Message {}

    fn names(chain: &Chain) -> Vec<&str> {
        chain.steps().iter().map(|step| step.name()).collect()
    }

    fn issues(builder: ChainBuilder) -> Vec<BuildIssue> {
        match builder.build() {
            Ok(_) => panic!("expected the build to fail"),
            Err(err) => err.issues().to_vec(),
        }
    }

    #[test]
    fn test_linear_chain_order() {
        let mut builder = ChainBuilder::new();
        builder.add_final(ItemId::simple::<Output>());

        builder
            .step("last")
            .consumes(ItemId::simple::<Config>())
            .produces(ItemId::simple::<Output>())
            .run(|_| Ok(()));
        builder
            .step("first")
            .produces(ItemId::simple::<Config>())
            .run(|_| Ok(()));

        let chain = builder.build().unwrap();
        assert_eq!(names(&chain), ["first", "last"]);
        assert_eq!(chain.steps()[1].dependencies(), &[0]);
        assert_eq!(chain.steps()[0].dependents, vec![1]);
    }

    #[test]
    fn test_prunes_unused_steps() {
        let mut builder = ChainBuilder::new();
        builder.add_final(ItemId::simple::<Output>());

        let used = builder
            .step("used")
            .produces(ItemId::simple::<Output>())
            .run(|_| Ok(()));
        let unused = builder
            .step("unused")
            .produces(ItemId::simple::<Extra>())
            .run(|_| Ok(()));
        let silent = builder
            .step("no-output")
            .consumes(ItemId::simple::<Output>())
            .run(|_| Ok(()));

        let chain = builder.build().unwrap();
        assert_eq!(names(&chain), ["used"]);
        assert_eq!(chain.ordinal_of(used), Some(0));
        assert_eq!(chain.ordinal_of(unused), None);
        assert_eq!(chain.ordinal_of(silent), None);
    }

    #[test]
    fn test_pruning_is_transitive() {
        let mut builder = ChainBuilder::new();
        builder.add_final(ItemId::simple::<Output>());

        builder
            .step("output")
            .produces(ItemId::simple::<Output>())
            .run(|_| Ok(()));
        builder
            .step("dead-end")
            .consumes(ItemId::simple::<Config>())
            .produces(ItemId::simple::<Extra>())
            .run(|_| Ok(()));
        builder
            .step("feeds-dead-end")
            .produces(ItemId::simple::<Config>())
            .run(|_| Ok(()));

        let chain = builder.build().unwrap();
        assert_eq!(names(&chain), ["output"]);
    }

    #[test]
    fn test_always_run_keeps_step() {
        let mut builder = ChainBuilder::new();
        builder.add_final(ItemId::simple::<Output>());

        builder
            .step("output")
            .produces(ItemId::simple::<Output>())
            .run(|_| Ok(()));
        builder
            .step("report")
            .consumes(ItemId::simple::<Config>())
            .always_run()
            .run(|_| Ok(()));
        builder
            .step("config")
            .produces(ItemId::simple::<Config>())
            .run(|_| Ok(()));

        let chain = builder.build().unwrap();
        assert_eq!(names(&chain), ["output", "config", "report"]);
    }

    #[test]
    fn test_missing_final_producer() {
        let mut builder = ChainBuilder::new();
        builder.add_final(ItemId::simple::<Output>());
        builder
            .step("other")
            .produces(ItemId::simple::<Extra>())
            .run(|_| Ok(()));

        let issues = issues(builder);
        assert_eq!(issues.len(), 1);
        assert!(matches!(issues[0], BuildIssue::MissingFinalProducer { item } if item == ItemId::simple::<Output>()));
        assert!(issues[0].to_string().contains("Output"));
    }

    #[test]
    fn test_weak_final_may_be_empty() {
        let mut builder = ChainBuilder::new();
        builder.add_final(ItemId::weak::<Output>());

        let chain = builder.build().unwrap();
        assert!(chain.is_empty());
    }

    #[test]
    fn test_initial_final_needs_no_producer() {
        let mut builder = ChainBuilder::new();
        builder
            .add_initial(ItemId::simple::<Input>())
            .add_final(ItemId::simple::<Input>());

        let chain = builder.build().unwrap();
        assert!(chain.is_empty());
    }

    #[test]
    fn test_cycle_detected() {
        let mut builder = ChainBuilder::new();
        builder.add_final(ItemId::simple::<Output>());

        builder
            .step("a")
            .consumes(ItemId::simple::<Extra>())
            .produces(ItemId::simple::<Config>())
            .run(|_| Ok(()));
        builder
            .step("b")
            .consumes(ItemId::simple::<Config>())
            .produces(ItemId::simple::<Extra>())
            .produces(ItemId::simple::<Output>())
            .run(|_| Ok(()));

        let issues = issues(builder);
        assert_eq!(issues.len(), 1);

        let BuildIssue::Cycle { path } = &issues[0] else {
            panic!("expected a cycle, got {}", issues[0]);
        };

        // a real cycle: every link produces what the next link consumes
        assert_eq!(path.len(), 2);
        assert_eq!(&*path[0].step.name, "a");
        assert_eq!(path[0].item, ItemId::simple::<Config>());
        assert_eq!(&*path[1].step.name, "b");
        assert_eq!(path[1].item, ItemId::simple::<Extra>());

        let message = issues[0].to_string();
        assert!(message.starts_with("Cycle detected:"));
        assert!(message.contains("'a'"));
        assert!(message.contains("'b'"));
    }

    #[test]
    fn test_self_cycle_detected() {
        let mut builder = ChainBuilder::new();
        builder.add_final(ItemId::multi::<Message>());

        builder
            .step("echo")
            .consumes(ItemId::multi::<Message>())
            .produces(ItemId::multi::<Message>())
            .run(|_| Ok(()));

        let issues = issues(builder);
        assert!(matches!(&issues[..], [BuildIssue::Cycle { path }] if path.len() == 1));
    }

    #[test]
    fn test_cycle_among_pruned_steps_is_ignored() {
        let mut builder = ChainBuilder::new();
        builder.add_final(ItemId::simple::<Output>());

        builder
            .step("output")
            .produces(ItemId::simple::<Output>())
            .run(|_| Ok(()));
        builder
            .step("a")
            .consumes(ItemId::simple::<Extra>())
            .produces(ItemId::simple::<Config>())
            .run(|_| Ok(()));
        builder
            .step("b")
            .consumes(ItemId::simple::<Config>())
            .produces(ItemId::simple::<Extra>())
            .run(|_| Ok(()));

        assert!(builder.build().is_ok());
    }

    #[test]
    fn test_duplicate_producers() {
        let mut builder = ChainBuilder::new();
        builder.add_final(ItemId::simple::<Output>());

        for name in ["one", "two"] {
            builder
                .step(name)
                .produces(ItemId::simple::<Output>())
                .run(|_| Ok(()));
        }

        let issues = issues(builder);
        assert!(matches!(&issues[..], [BuildIssue::DuplicateProducers { producers, .. }] if producers.len() == 2));

        let message = issues[0].to_string();
        assert!(message.contains("'one'"));
        assert!(message.contains("'two'"));
        assert!(!message.contains("overridable"));
    }

    #[test]
    fn test_duplicate_producers_mentions_unused_overridable() {
        let mut builder = ChainBuilder::new();
        builder.add_final(ItemId::simple::<Output>());

        for name in ["one", "two"] {
            builder
                .step(name)
                .produces(ItemId::simple::<Output>())
                .run(|_| Ok(()));
        }
        builder
            .step("fallback")
            .produces_with(ItemId::simple::<Output>(), ProduceFlags::OVERRIDABLE)
            .run(|_| Ok(()));

        let message = issues(builder)[0].to_string();
        assert!(message.contains("'fallback'"));
        assert!(message.contains("would have been unused"));
    }

    #[test]
    fn test_all_overridable() {
        let mut builder = ChainBuilder::new();
        builder.add_final(ItemId::simple::<Output>());

        for name in ["one", "two"] {
            builder
                .step(name)
                .produces_with(ItemId::simple::<Output>(), ProduceFlags::OVERRIDABLE)
                .run(|_| Ok(()));
        }

        let issues = issues(builder);
        assert!(matches!(&issues[..], [BuildIssue::AllOverridable { .. }]));
        assert!(issues[0].to_string().contains("overridable"));
    }

    #[test]
    fn test_single_overridable_wins() {
        let mut builder = ChainBuilder::new();
        builder.add_final(ItemId::simple::<Output>());

        builder
            .step("default")
            .produces_with(ItemId::simple::<Output>(), ProduceFlags::OVERRIDABLE)
            .run(|_| Ok(()));

        let chain = builder.build().unwrap();
        assert_eq!(names(&chain), ["default"]);
    }

    #[test]
    fn test_concrete_overrides_overridable() {
        let mut builder = ChainBuilder::new();
        builder.add_final(ItemId::simple::<Output>());

        builder
            .step("default")
            .produces_with(ItemId::simple::<Output>(), ProduceFlags::OVERRIDABLE)
            .run(|_| Ok(()));
        builder
            .step("concrete")
            .produces(ItemId::simple::<Output>())
            .run(|_| Ok(()));

        let chain = builder.build().unwrap();
        assert_eq!(names(&chain), ["concrete"]);
        assert_eq!(chain.producers_of(&ItemId::simple::<Output>()), &[crate::Ordinal::Step(0)]);
    }

    #[test]
    fn test_overridden_step_survives_with_other_outputs() {
        let mut builder = ChainBuilder::new();
        builder
            .add_final(ItemId::simple::<Output>())
            .add_final(ItemId::simple::<Extra>());

        builder
            .step("default")
            .produces_with(ItemId::simple::<Output>(), ProduceFlags::OVERRIDABLE)
            .produces(ItemId::simple::<Extra>())
            .run(|_| Ok(()));
        builder
            .step("concrete")
            .produces(ItemId::simple::<Output>())
            .run(|_| Ok(()));

        let chain = builder.build().unwrap();
        assert_eq!(names(&chain), ["default", "concrete"]);
        assert_eq!(chain.plan().steps[0].produces.len(), 1);
    }

    #[test]
    fn test_unsatisfied_consumer() {
        let mut builder = ChainBuilder::new();
        builder.add_final(ItemId::simple::<Output>());

        builder
            .step("needs-config")
            .consumes(ItemId::simple::<Config>())
            .produces(ItemId::simple::<Output>())
            .run(|_| Ok(()));

        let issues = issues(builder);
        assert!(matches!(&issues[..], [BuildIssue::UnsatisfiedConsumer { item, .. }] if *item == ItemId::simple::<Config>()));

        let message = issues[0].to_string();
        assert!(message.contains("Config"));
        assert!(message.contains("'needs-config'"));
    }

    #[test]
    fn test_optional_multi_and_weak_consumes_are_not_required() {
        let mut builder = ChainBuilder::new();
        builder.add_final(ItemId::simple::<Output>());

        builder
            .step("tolerant")
            .consumes_with(ItemId::simple::<Config>(), ConsumeFlags::OPTIONAL)
            .consumes(ItemId::multi::<Message>())
            .consumes(ItemId::weak::<Extra>())
            .produces(ItemId::simple::<Output>())
            .run(|_| Ok(()));

        assert!(builder.build().is_ok());
    }

    #[test]
    fn test_initial_produced_is_a_conflict() {
        let mut builder = ChainBuilder::new();
        builder
            .add_initial(ItemId::simple::<Input>())
            .add_final(ItemId::simple::<Output>());

        builder
            .step("shadow")
            .produces(ItemId::simple::<Input>())
            .produces(ItemId::simple::<Output>())
            .run(|_| Ok(()));

        let issues = issues(builder);
        assert!(matches!(&issues[..], [BuildIssue::InitialProduced { .. }]));
    }

    #[test]
    fn test_collects_every_issue() {
        let mut builder = ChainBuilder::new();
        builder
            .add_final(ItemId::simple::<Output>())
            .add_final(ItemId::simple::<Extra>());

        for name in ["one", "two"] {
            builder
                .step(name)
                .produces(ItemId::simple::<Output>())
                .run(|_| Ok(()));
        }

        let err = builder.build().unwrap_err();
        assert_eq!(err.issues().len(), 2);
        assert!(err.to_string().contains("2 issues found"));
    }

    #[test]
    fn test_weak_produce_orders_but_does_not_pull() {
        let mut builder = ChainBuilder::new();
        builder.add_final(ItemId::simple::<Output>());

        builder
            .step("consumer")
            .consumes(ItemId::weak::<Config>())
            .produces(ItemId::simple::<Output>())
            .run(|_| Ok(()));
        builder
            .step("weak-config")
            .produces(ItemId::weak::<Config>())
            .run(|_| Ok(()));

        // nothing pulls the weak producer in
        let chain = builder.build().unwrap();
        assert_eq!(names(&chain), ["consumer"]);

        let mut builder = ChainBuilder::new();
        builder
            .add_final(ItemId::simple::<Output>())
            .add_final(ItemId::simple::<Extra>());

        builder
            .step("consumer")
            .consumes(ItemId::weak::<Config>())
            .produces(ItemId::simple::<Output>())
            .run(|_| Ok(()));
        builder
            .step("weak-config")
            .produces(ItemId::weak::<Config>())
            .produces(ItemId::simple::<Extra>())
            .run(|_| Ok(()));

        // live for another reason, so it still runs first
        let chain = builder.build().unwrap();
        assert_eq!(names(&chain), ["weak-config", "consumer"]);
    }

    #[test]
    fn test_weak_flag_does_not_pull() {
        let mut builder = ChainBuilder::new();
        builder.add_final(ItemId::multi::<Message>());

        builder
            .step("strong")
            .produces(ItemId::multi::<Message>())
            .run(|_| Ok(()));
        builder
            .step("weak")
            .produces_with(ItemId::multi::<Message>(), ProduceFlags::WEAK)
            .run(|_| Ok(()));

        let chain = builder.build().unwrap();
        assert_eq!(names(&chain), ["strong"]);
    }

    fn priority_example(prioritize: bool) -> Vec<String> {
        struct LoggingReady;
        impl SimpleItem for LoggingReady {}

        let mut builder = ChainBuilder::new();
        builder.add_final(ItemId::simple::<Output>());
        if prioritize {
            builder.add_priority_item(ItemId::simple::<LoggingReady>());
        }

        builder
            .step("feature-init")
            .produces(ItemId::multi::<Message>())
            .run(|_| Ok(()));
        builder
            .step("base-config")
            .produces(ItemId::simple::<Config>())
            .produces(ItemId::multi::<Message>())
            .run(|_| Ok(()));
        builder
            .step("logging-setup")
            .consumes(ItemId::simple::<Config>())
            .produces(ItemId::simple::<LoggingReady>())
            .produces(ItemId::multi::<Message>())
            .run(|_| Ok(()));
        builder
            .step("collect")
            .consumes(ItemId::multi::<Message>())
            .produces(ItemId::simple::<Output>())
            .run(|_| Ok(()));

        let chain = builder.build().unwrap();
        chain.steps().iter().map(|step| step.name().to_string()).collect()
    }

    #[test]
    fn test_priority_moves_closure_earlier() {
        assert_eq!(
            priority_example(false),
            ["feature-init", "base-config", "logging-setup", "collect"]
        );
        assert_eq!(
            priority_example(true),
            ["base-config", "logging-setup", "feature-init", "collect"]
        );
    }

    struct FastReady;
    impl SimpleItem for FastReady {}

    struct SlowReady;
    impl SimpleItem for SlowReady {}

    /// Two priority closures sharing the `shared` step. `slow-root` only
    /// belongs to the `SlowReady` closure and is declared before `shared`.
    fn overlapping_priorities(hints: &[ItemId]) -> Vec<String> {
        let mut builder = ChainBuilder::new();
        builder.add_final(ItemId::simple::<Output>());
        for hint in hints {
            builder.add_priority_item(*hint);
        }

        builder
            .step("filler")
            .produces(ItemId::multi::<Message>())
            .run(|_| Ok(()));
        builder
            .step("slow-root")
            .produces(ItemId::simple::<Extra>())
            .run(|_| Ok(()));
        builder
            .step("slow-setup")
            .consumes(ItemId::simple::<Config>())
            .consumes(ItemId::simple::<Extra>())
            .produces(ItemId::simple::<SlowReady>())
            .produces(ItemId::multi::<Message>())
            .run(|_| Ok(()));
        builder
            .step("shared")
            .produces(ItemId::simple::<Config>())
            .produces(ItemId::multi::<Message>())
            .run(|_| Ok(()));
        builder
            .step("fast-setup")
            .consumes(ItemId::simple::<Config>())
            .produces(ItemId::simple::<FastReady>())
            .produces(ItemId::multi::<Message>())
            .run(|_| Ok(()));
        builder
            .step("collect")
            .consumes(ItemId::multi::<Message>())
            .produces(ItemId::simple::<Output>())
            .run(|_| Ok(()));

        let chain = builder.build().unwrap();
        chain.steps().iter().map(|step| step.name().to_string()).collect()
    }

    #[test]
    fn test_overlapping_priority_closures() {
        let fast = ItemId::simple::<FastReady>();
        let slow = ItemId::simple::<SlowReady>();

        assert_eq!(
            overlapping_priorities(&[]),
            ["filler", "slow-root", "shared", "slow-setup", "fast-setup", "collect"]
        );

        // `shared` keeps the rank of the earlier hint and runs before
        // `slow-root`, which only has the later one
        assert_eq!(
            overlapping_priorities(&[fast, slow]),
            ["shared", "fast-setup", "slow-root", "slow-setup", "filler", "collect"]
        );

        assert_eq!(
            overlapping_priorities(&[slow, fast]),
            ["slow-root", "shared", "slow-setup", "fast-setup", "filler", "collect"]
        );
    }

    #[test]
    fn test_multi_producer_index() {
        let mut builder = ChainBuilder::new();
        builder
            .add_initial(ItemId::multi::<Message>())
            .add_final(ItemId::multi::<Message>());

        builder
            .step("second")
            .consumes(ItemId::simple::<Config>())
            .produces(ItemId::multi::<Message>())
            .run(|_| Ok(()));
        builder
            .step("first")
            .produces(ItemId::simple::<Config>())
            .produces(ItemId::multi::<Message>())
            .run(|_| Ok(()));

        let chain = builder.build().unwrap();
        assert_eq!(
            chain.producers_of(&ItemId::multi::<Message>()),
            &[
                crate::Ordinal::Initial,
                crate::Ordinal::Step(0),
                crate::Ordinal::Step(1)
            ]
        );
    }
}
