//! CtOp level minimisation: lowers each node's level to the minimum its
//! consumers actually require, reclaiming levels an expansion pass spent
//! conservatively.

use std::collections::HashMap;

use crate::ctop::{CtOp, CtProgram};
use crate::dag::NodeId;
use crate::error::Result;
use crate::level::{Level, LevelInfo};

/// Walk `program`'s DAG in reverse topological order, setting each node's
/// level to `max(children's required level)`, or leaving it untouched if it
/// has no children. `BootstrapC` nodes are exempt: their level is fixed by
/// the backend's bootstrapping protocol, not by what their consumers need.
pub fn minimize_levels(program: &mut CtProgram) -> Result<()> {
    let mut required: HashMap<NodeId, u32> = HashMap::new();

    for id in program.dag().reverse_topological_order() {
        let node = program
            .dag()
            .value(id)
            .expect("reverse topological id always has a value")
            .clone();
        let current_level = node.info.level.0;

        if matches!(node.op, CtOp::BootstrapC) {
            required.insert(id, current_level);
            continue;
        }

        let children = program.dag().children(id);
        let needed = children
            .iter()
            .filter_map(|c| required.get(c).copied())
            .max()
            .unwrap_or(current_level)
            .min(current_level);
        required.insert(id, needed);

        if needed != current_level {
            let updated = crate::ctop::LeveledCtOp {
                op: node.op,
                info: LevelInfo::new(Level(needed), node.info.log_scale),
            };
            program.dag_mut().set_value(id, updated)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ProgramContext;
    use crate::ctop::{CtOpDag, LeveledCtOp};
    use crate::level::{BootstrappingPrecision, LogScale};

    fn ctx() -> ProgramContext {
        ProgramContext::new(2, 20, 4, BootstrappingPrecision::P19).unwrap()
    }

    #[test]
    fn a_leaf_with_no_children_keeps_its_level() {
        let mut program = CtProgram::new(ctx(), CtOpDag::new());
        let id = program.dag_mut().add_input(LeveledCtOp {
            op: CtOp::InputC { name: "x".into(), chunk_offset: 0 },
            info: LevelInfo::new(Level(4), LogScale(20)),
        });
        minimize_levels(&mut program).unwrap();
        assert_eq!(program.dag().value(id).unwrap().info.level.0, 4);
    }

    #[test]
    fn a_chain_is_lowered_to_its_consumer_level() {
        let mut program = CtProgram::new(ctx(), CtOpDag::new());
        let x = program.dag_mut().add_input(LeveledCtOp {
            op: CtOp::InputC { name: "x".into(), chunk_offset: 0 },
            info: LevelInfo::new(Level(4), LogScale(20)),
        });
        let mid = program
            .dag_mut()
            .add_node(
                LeveledCtOp { op: CtOp::RescaleC, info: LevelInfo::new(Level(4), LogScale(0)) },
                vec![x],
                vec![],
            )
            .unwrap();
        let _out = program
            .dag_mut()
            .add_node(
                LeveledCtOp { op: CtOp::OutputC { name: "o".into(), chunk_offset: 0 }, info: LevelInfo::new(Level(2), LogScale(0)) },
                vec![mid],
                vec![],
            )
            .unwrap();

        minimize_levels(&mut program).unwrap();
        assert_eq!(program.dag().value(mid).unwrap().info.level.0, 2);
        assert_eq!(program.dag().value(x).unwrap().info.level.0, 2);
    }

    #[test]
    fn bootstrap_nodes_keep_their_level_regardless_of_consumers() {
        let mut program = CtProgram::new(ctx(), CtOpDag::new());
        let x = program.dag_mut().add_input(LeveledCtOp {
            op: CtOp::InputC { name: "x".into(), chunk_offset: 0 },
            info: LevelInfo::new(Level(4), LogScale(20)),
        });
        let boot = program
            .dag_mut()
            .add_node(
                LeveledCtOp { op: CtOp::BootstrapC, info: LevelInfo::new(Level(4), LogScale(20)) },
                vec![x],
                vec![],
            )
            .unwrap();
        let _out = program
            .dag_mut()
            .add_node(
                LeveledCtOp { op: CtOp::OutputC { name: "o".into(), chunk_offset: 0 }, info: LevelInfo::new(Level(1), LogScale(20)) },
                vec![boot],
                vec![],
            )
            .unwrap();

        minimize_levels(&mut program).unwrap();
        assert_eq!(program.dag().value(boot).unwrap().info.level.0, 4);
    }
}
