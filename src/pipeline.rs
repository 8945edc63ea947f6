//! The `compile` entry point (§4.12): chains every pass in data-flow order,
//! threading the `ProgramContext`/`PassConfig` through, and assembles the
//! cross-pass provenance archive the returned program carries.

use std::collections::HashMap;

use crate::context::{CtOpPolicy, LevelingPolicy, PassConfig, ProgramContext};
use crate::ctop::{CtOpDag, CtProgram};
use crate::ctop_opts::minimize_levels;
use crate::dag::{Dag, NodeId};
use crate::embryo::{merge_strides, repack_shower, EmbryoDag};
use crate::error::Result;
use crate::expand::expand_to_ctops;
use crate::layout_opts::{hoist_conversions, rewrite_input_layouts, value_number};
use crate::layout_pass::assign_layouts;
use crate::leveling::{assign_levels, assign_levels_lazy, assign_levels_noop, bootstrap_frontiers, chet_lazy_frontiers};
use crate::leveling_opts::prune_bootstraps;
use crate::rescale::assign_scales;

/// One pass's destination-id -> source-ids archive, readable line by line
/// per §6. Adjacent archives compose by relational join: `trace` walks the
/// chain from the last pass back to the first, unioning source sets at each
/// step.
#[derive(Debug, Clone, Default)]
pub struct Provenance {
    archives: Vec<(&'static str, HashMap<NodeId, Vec<NodeId>>)>,
}

impl Provenance {
    pub fn new() -> Self {
        Provenance { archives: Vec::new() }
    }

    /// Snapshot `dag`'s `ancestors()` for every live node under `stage`'s name.
    /// Every pass in this crate already threads the previous stage's node ids
    /// through as ancestors, so the archive falls directly out of the dag it
    /// produced.
    pub(crate) fn record<T>(&mut self, stage: &'static str, dag: &Dag<T>) {
        let archive = dag.node_ids().into_iter().map(|id| (id, dag.ancestors(id).to_vec())).collect();
        self.archives.push((stage, archive));
    }

    /// The stage names recorded, in pipeline order.
    pub fn stages(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.archives.iter().map(|(name, _)| *name)
    }

    /// The raw destination-to-source archive for one stage, if recorded.
    pub fn archive(&self, stage: &str) -> Option<&HashMap<NodeId, Vec<NodeId>>> {
        self.archives.iter().find(|(name, _)| *name == stage).map(|(_, a)| a)
    }

    /// Map a node id in the final pass's output back through every
    /// intermediate archive to the set of originating embryo node ids.
    pub fn trace(&self, id: NodeId) -> Vec<NodeId> {
        let mut frontier = vec![id];
        for (_, archive) in self.archives.iter().rev() {
            let mut next = Vec::new();
            for id in frontier {
                match archive.get(&id) {
                    Some(sources) => next.extend(sources.iter().copied()),
                    None => next.push(id),
                }
            }
            frontier = next;
        }
        frontier.sort_unstable();
        frontier.dedup();
        frontier
    }
}

/// Chain every pass in the order fixed by the data-flow diagram: embryo
/// optimisations, layout assignment and its optimisers, waterline rescaling,
/// leveling (dispatched on `config.leveling_policy()`), bootstrap pruning,
/// and ciphertext expansion (dispatched on `config.ctop_policy()`). The
/// returned program's `provenance()` is the union of every pass's archive.
pub fn compile(embryo_dag: &EmbryoDag, ctx: &ProgramContext, config: &PassConfig) -> Result<CtProgram> {
    let span = tracing::info_span!("compile", dag_nodes = embryo_dag.len());
    let _enter = span.enter();
    let mut provenance = Provenance::new();

    let merged = merge_strides(embryo_dag)?;
    provenance.record("embryo::merge_strides", &merged);
    tracing::debug!(nodes = merged.len(), "merge_strides done");

    let embryo_final = if config.repack_shower() {
        let showered = repack_shower(&merged)?;
        provenance.record("embryo::repack_shower", &showered);
        tracing::debug!(nodes = showered.len(), "repack_shower done");
        showered
    } else {
        merged
    };

    let laid_out = assign_layouts(&embryo_final, ctx, config)?;
    provenance.record("layout_pass::assign_layouts", &laid_out);
    tracing::debug!(nodes = laid_out.len(), "assign_layouts done");

    let hoisted = hoist_conversions(&laid_out)?;
    provenance.record("layout_opts::hoist_conversions", &hoisted);

    let numbered = value_number(&hoisted)?;
    provenance.record("layout_opts::value_number", &numbered);

    let rewritten = rewrite_input_layouts(&numbered)?;
    provenance.record("layout_opts::rewrite_input_layouts", &rewritten);
    tracing::debug!(nodes = rewritten.len(), "layout optimisers done");

    let scaled = assign_scales(&rewritten, ctx)?;
    provenance.record("rescale::assign_scales", &scaled);
    tracing::debug!(nodes = scaled.len(), "assign_scales done");

    let leveled = match config.leveling_policy() {
        LevelingPolicy::Dp => {
            let frontiers = bootstrap_frontiers(&scaled, ctx)?;
            tracing::debug!(frontiers = frontiers.len(), "dp bootstrap frontiers selected");
            assign_levels(&scaled, ctx, &frontiers)?
        }
        LevelingPolicy::Lazy => {
            tracing::debug!("lazy leveling: reactive bootstrap placement");
            assign_levels_lazy(&scaled, ctx)?
        }
        LevelingPolicy::Noop => {
            tracing::debug!("noop leveling: no bootstraps will be inserted");
            assign_levels_noop(&scaled, ctx)?
        }
        LevelingPolicy::ChetLazy => {
            let frontiers = chet_lazy_frontiers(&scaled, ctx);
            tracing::debug!(frontiers = frontiers.len(), "chet-lazy frontiers selected");
            assign_levels(&scaled, ctx, &frontiers)?
        }
    };
    provenance.record("leveling::assign_levels", &leveled);

    let pruned = prune_bootstraps(&leveled, ctx)?;
    provenance.record("leveling_opts::prune_bootstraps", &pruned);
    tracing::debug!(nodes = pruned.len(), "prune_bootstraps done");

    let mut program = match config.ctop_policy() {
        CtOpPolicy::Basic => {
            let mut program = expand_to_ctops(&pruned, ctx)?;
            provenance.record("expand::expand_to_ctops", program.dag());
            tracing::debug!(nodes = program.dag().len(), "expand_to_ctops done");
            minimize_levels(&mut program)?;
            tracing::debug!("minimize_levels done");
            program
        }
        CtOpPolicy::Dummy => {
            tracing::debug!("dummy ctop policy: skipping expansion");
            CtProgram::new(*ctx, CtOpDag::new())
        }
    };

    program.set_provenance(provenance);
    Ok(program)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{CtOpPolicy, LayoutPolicy};
    use crate::level::BootstrappingPrecision;
    use crate::shape::Shape;
    use crate::top::TOpEmbryo;

    fn ctx() -> ProgramContext {
        ProgramContext::new(2, 20, 4, BootstrappingPrecision::P19).unwrap()
    }

    fn config(leveling_policy: LevelingPolicy, ctop_policy: CtOpPolicy) -> PassConfig {
        PassConfig::new(LayoutPolicy::FillGaps, leveling_policy, ctop_policy, false, 64).unwrap()
    }

    fn single_input_output_embryo() -> EmbryoDag {
        let shape = Shape::new(vec![4]).unwrap();
        let mut dag = EmbryoDag::new();
        let x = dag.add_input(TOpEmbryo::InputC { shape: shape.clone(), name: "x".into(), log_scale: 20 });
        dag.add_node(TOpEmbryo::OutputC { shape, name: "y".into() }, vec![x], vec![]).unwrap();
        dag
    }

    #[test]
    fn compile_with_dp_leveling_and_basic_ctop_produces_a_program() {
        let embryo = single_input_output_embryo();
        let program = compile(&embryo, &ctx(), &config(LevelingPolicy::Dp, CtOpPolicy::Basic)).unwrap();
        assert!(!program.dag().is_empty());
        assert!(program.provenance().stages().count() > 0);
    }

    #[test]
    fn compile_with_dummy_ctop_policy_skips_expansion() {
        let embryo = single_input_output_embryo();
        let program = compile(&embryo, &ctx(), &config(LevelingPolicy::Dp, CtOpPolicy::Dummy)).unwrap();
        assert!(program.dag().is_empty());
    }

    #[test]
    fn compile_with_noop_leveling_succeeds_on_a_shallow_graph() {
        let embryo = single_input_output_embryo();
        let program = compile(&embryo, &ctx(), &config(LevelingPolicy::Noop, CtOpPolicy::Basic)).unwrap();
        assert!(!program.dag().is_empty());
    }

    #[test]
    fn compile_with_lazy_leveling_succeeds() {
        let embryo = single_input_output_embryo();
        let program = compile(&embryo, &ctx(), &config(LevelingPolicy::Lazy, CtOpPolicy::Basic)).unwrap();
        assert!(!program.dag().is_empty());
    }

    #[test]
    fn compile_with_chet_lazy_leveling_succeeds() {
        let embryo = single_input_output_embryo();
        let program = compile(&embryo, &ctx(), &config(LevelingPolicy::ChetLazy, CtOpPolicy::Basic)).unwrap();
        assert!(!program.dag().is_empty());
    }

    #[test]
    fn provenance_traces_a_ctop_node_back_to_an_embryo_node() {
        let embryo = single_input_output_embryo();
        let embryo_input = embryo.topological_order()[0];
        let program = compile(&embryo, &ctx(), &config(LevelingPolicy::Dp, CtOpPolicy::Basic)).unwrap();
        let some_ct_node = program.dag().topological_order()[0];
        let traced = program.provenance().trace(some_ct_node);
        assert!(traced.contains(&embryo_input));
    }
}
