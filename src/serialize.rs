//! The textual wire format: a human-diffable, line-oriented dump, readable
//! line by line, that every IR in the pipeline can round-trip through — the
//! layout-assigned TOp DAG, the leveled TOp DAG, and the compiled CtOp
//! program alike.
//!
//! Grammar:
//! - node line (TOp/leveled-TOp/CtOp dags alike): `<id> <ancestor_list>
//!   <payload> <parent_id_list>`
//! - id list: `<count> <id>...`
//! - TOp payload: `<type_name> <type-specific fields>` (no level info; the
//!   layout pass hasn't assigned levels yet)
//! - leveled-TOp/CtOp payload: `<type_name> <level> <log_scale>
//!   <type-specific fields>`
//! - layout: `<shape> <log_chunk_size> <bit_count> <bit>...`, each bit
//!   `<dim>:<bit_index>` or `_`
//! - shape: `<rank> <dim>...`
//! - `ChunkIr`: `MASK <size> <one_count> <one_index>...` or
//!   `INDIRECTION <frontend_tensor> <index_count> <index>...` where an index
//!   is `_` for `None`
//!
//! Every dag serializer restores each node under its original `NodeId` (via
//! [`crate::dag::Dag::add_node_with_id`]), so `parse(serialise(x))` is the
//! identity on node ids too, not just an isomorphic relabelling — a
//! provenance archive dumped alongside a dag keys on exactly these ids.

use crate::ctop::{ChunkIr, ChunkIrHandle, CtOp, CtOpDag, CtProgram, LeveledCtOp};
use crate::dag::NodeId;
use crate::error::{LowerError, Result};
use crate::layout::{DimensionBit, LayoutBit, TensorLayout};
use crate::layout_pass::TOpDag;
use crate::level::{Level, LevelInfo, LogScale};
use crate::leveling::{LeveledDag, LeveledTOp};
use crate::pipeline::Provenance;
use crate::shape::Shape;
use crate::top::{PlaintextTensor, TOp};

struct TokWriter {
    toks: Vec<String>,
}

impl TokWriter {
    fn new() -> Self {
        TokWriter { toks: Vec::new() }
    }

    fn tok(&mut self, s: impl Into<String>) -> &mut Self {
        self.toks.push(s.into());
        self
    }

    fn list<T>(&mut self, items: &[T], mut one: impl FnMut(&mut Self, &T)) -> &mut Self {
        self.tok(items.len().to_string());
        for item in items {
            one(self, item);
        }
        self
    }

    fn finish(self) -> String {
        self.toks.join(" ")
    }
}

struct TokReader<'a> {
    toks: std::vec::IntoIter<&'a str>,
}

impl<'a> TokReader<'a> {
    fn new(line: &'a str) -> Self {
        TokReader {
            toks: line.split_whitespace().collect::<Vec<_>>().into_iter(),
        }
    }

    fn next(&mut self) -> Result<&'a str> {
        self.toks
            .next()
            .ok_or_else(|| LowerError::structural("serialize::TokReader", [], "unexpected end of tokens"))
    }

    fn parse<T: std::str::FromStr>(&mut self, what: &'static str) -> Result<T> {
        self.next()?
            .parse()
            .map_err(|_| LowerError::numeric(what, format!("could not parse token as {what}")))
    }

    fn list<T>(&mut self, mut one: impl FnMut(&mut Self) -> Result<T>) -> Result<Vec<T>> {
        let count: usize = self.parse("list count")?;
        (0..count).map(|_| one(self)).collect()
    }
}

fn serialize_shape(w: &mut TokWriter, shape: &Shape) {
    w.list(shape.dims(), |w, d| {
        w.tok(d.to_string());
    });
}

fn read_shape(r: &mut TokReader) -> Result<Shape> {
    let dims = r.list(|r| r.parse("shape dimension"))?;
    Shape::new(dims)
}

fn serialize_bit(w: &mut TokWriter, bit: &LayoutBit) {
    match bit {
        LayoutBit::Gap => {
            w.tok("_");
        }
        LayoutBit::Dim(db) => {
            w.tok(format!("{}:{}", db.dim, db.bit_index));
        }
    }
}

fn read_bit(r: &mut TokReader) -> Result<LayoutBit> {
    let tok = r.next()?;
    if tok == "_" {
        return Ok(LayoutBit::Gap);
    }
    let (dim_s, bit_s) = tok
        .split_once(':')
        .ok_or_else(|| LowerError::structural("serialize::read_bit", [], format!("malformed bit token `{tok}`")))?;
    let dim: usize = dim_s
        .parse()
        .map_err(|_| LowerError::numeric("layout bit dim", "could not parse dimension index"))?;
    let bit_index: u32 = bit_s
        .parse()
        .map_err(|_| LowerError::numeric("layout bit index", "could not parse bit index"))?;
    Ok(LayoutBit::Dim(DimensionBit { dim, bit_index }))
}

fn serialize_layout(w: &mut TokWriter, layout: &TensorLayout) {
    serialize_shape(w, layout.shape());
    w.tok(layout.log_chunk_size().to_string());
    w.list(layout.bits(), |w, bit| serialize_bit(w, bit));
}

fn read_layout(r: &mut TokReader) -> Result<TensorLayout> {
    let shape = read_shape(r)?;
    let log_chunk_size: u32 = r.parse("layout log_chunk_size")?;
    let bits = r.list(read_bit)?;
    TensorLayout::new(shape, log_chunk_size, bits)
}

fn serialize_level_info(w: &mut TokWriter, info: &LevelInfo) {
    w.tok(info.level.0.to_string());
    w.tok(info.log_scale.0.to_string());
}

fn read_level_info(r: &mut TokReader) -> Result<LevelInfo> {
    let level: u32 = r.parse("level")?;
    let log_scale: u32 = r.parse("log_scale")?;
    Ok(LevelInfo::new(Level(level), LogScale(log_scale)))
}

/// Serialize a single `ChunkIr` as one line of its own dictionary dump.
pub fn serialize_chunk_ir(chunk: &ChunkIr) -> String {
    let mut w = TokWriter::new();
    match chunk {
        ChunkIr::Mask { size, one_indices } => {
            w.tok("MASK").tok(size.to_string()).list(one_indices, |w, i| {
                w.tok(i.to_string());
            });
        }
        ChunkIr::Indirection { frontend_tensor, flat_indices } => {
            w.tok("INDIRECTION").tok(frontend_tensor.clone()).list(flat_indices, |w, idx| {
                match idx {
                    Some(i) => w.tok(i.to_string()),
                    None => w.tok("_"),
                };
            });
        }
    }
    w.finish()
}

pub fn deserialize_chunk_ir(line: &str) -> Result<ChunkIr> {
    let mut r = TokReader::new(line);
    match r.next()? {
        "MASK" => {
            let size: u64 = r.parse("mask size")?;
            let one_indices = r.list(|r| r.parse("mask one-index"))?;
            Ok(ChunkIr::Mask { size, one_indices })
        }
        "INDIRECTION" => {
            let frontend_tensor = r.next()?.to_string();
            let flat_indices = r.list(|r| {
                let tok = r.next()?;
                if tok == "_" {
                    Ok(None)
                } else {
                    tok.parse::<u64>()
                        .map(Some)
                        .map_err(|_| LowerError::numeric("indirection flat index", "could not parse flat index"))
                }
            })?;
            Ok(ChunkIr::Indirection { frontend_tensor, flat_indices })
        }
        other => Err(LowerError::structural(
            "serialize::deserialize_chunk_ir",
            [],
            format!("unknown ChunkIr tag `{other}`"),
        )),
    }
}

fn serialize_plaintext(w: &mut TokWriter, plaintext: &PlaintextTensor) {
    serialize_shape(w, &plaintext.shape);
    w.list(&plaintext.values, |w, v| {
        w.tok(v.to_string());
    });
}

fn read_plaintext(r: &mut TokReader) -> Result<PlaintextTensor> {
    let shape = read_shape(r)?;
    let values = r.list(|r| r.parse("plaintext value"))?;
    Ok(PlaintextTensor { shape, values })
}

/// Fields only, no type tag — the caller writes `op.type_name()` itself
/// (once), since every dag's node line shares that tag position regardless
/// of whether it also carries a `LevelInfo`.
fn serialize_top_payload(w: &mut TokWriter, op: &TOp) {
    match op {
        TOp::InputC { name, log_scale, output_layout } => {
            w.tok(name.clone()).tok(log_scale.to_string());
            serialize_layout(w, output_layout);
        }
        TOp::OutputC { name, input_layout } => {
            w.tok(name.clone());
            serialize_layout(w, input_layout);
        }
        TOp::AddCC { layout } | TOp::MulCC { layout } => {
            serialize_layout(w, layout);
        }
        TOp::AddCP { layout, plaintext } | TOp::MulCP { layout, plaintext } => {
            serialize_layout(w, layout);
            serialize_plaintext(w, plaintext);
        }
        TOp::AddCS { layout, scalar } | TOp::MulCS { layout, scalar } => {
            serialize_layout(w, layout);
            w.tok(scalar.to_string());
        }
        TOp::ReduceDimC { dim, input_layout, output_layout } => {
            w.tok(dim.to_string());
            serialize_layout(w, input_layout);
            serialize_layout(w, output_layout);
        }
        TOp::ReplicateDimC { dim, multiple, input_layout, output_layout } => {
            w.tok(dim.to_string()).tok(multiple.to_string());
            serialize_layout(w, input_layout);
            serialize_layout(w, output_layout);
        }
        TOp::ReorderDimsC { permutation, input_layout, output_layout } => {
            w.list(permutation, |w, p| {
                w.tok(p.to_string());
            });
            serialize_layout(w, input_layout);
            serialize_layout(w, output_layout);
        }
        TOp::ResizeDimC { input_layout, output_layout } => {
            serialize_layout(w, input_layout);
            serialize_layout(w, output_layout);
        }
        TOp::DropDimC { dim, input_layout, output_layout } => {
            w.tok(dim.to_string());
            serialize_layout(w, input_layout);
            serialize_layout(w, output_layout);
        }
        TOp::InsertDimC { dim, input_layout, output_layout } => {
            w.tok(dim.to_string());
            serialize_layout(w, input_layout);
            serialize_layout(w, output_layout);
        }
        TOp::StrideC { strides, input_layout, output_layout } | TOp::MergedStrideC { strides, input_layout, output_layout } => {
            w.list(strides, |w, s| {
                w.tok(s.to_string());
            });
            serialize_layout(w, input_layout);
            serialize_layout(w, output_layout);
        }
        TOp::CyclicShiftC { offset, input_layout, output_layout } | TOp::UnpaddedShiftC { offset, input_layout, output_layout } => {
            w.list(offset, |w, o| {
                w.tok(o.to_string());
            });
            serialize_layout(w, input_layout);
            serialize_layout(w, output_layout);
        }
        TOp::RotateC { shift, input_layout, output_layout } => {
            w.tok(shift.to_string());
            serialize_layout(w, input_layout);
            serialize_layout(w, output_layout);
        }
        TOp::ChetRepackC { input_layout, output_layout } | TOp::LayoutConversionC { input_layout, output_layout } => {
            serialize_layout(w, input_layout);
            serialize_layout(w, output_layout);
        }
        TOp::RescaleC { ct_log_scale, layout } => {
            w.tok(ct_log_scale.to_string());
            serialize_layout(w, layout);
        }
        TOp::BootstrapC { usable_levels, layout } => {
            w.tok(usable_levels.to_string());
            serialize_layout(w, layout);
        }
    }
}

fn read_top_payload_after_type_name(r: &mut TokReader, type_name: &str) -> Result<TOp> {
    match type_name {
        "InputC" => Ok(TOp::InputC {
            name: r.next()?.to_string(),
            log_scale: r.parse("log_scale")?,
            output_layout: read_layout(r)?,
        }),
        "OutputC" => Ok(TOp::OutputC { name: r.next()?.to_string(), input_layout: read_layout(r)? }),
        "AddCC" => Ok(TOp::AddCC { layout: read_layout(r)? }),
        "MulCC" => Ok(TOp::MulCC { layout: read_layout(r)? }),
        "AddCP" => Ok(TOp::AddCP { layout: read_layout(r)?, plaintext: read_plaintext(r)? }),
        "MulCP" => Ok(TOp::MulCP { layout: read_layout(r)?, plaintext: read_plaintext(r)? }),
        "AddCS" => Ok(TOp::AddCS { layout: read_layout(r)?, scalar: r.parse("scalar")? }),
        "MulCS" => Ok(TOp::MulCS { layout: read_layout(r)?, scalar: r.parse("scalar")? }),
        "ReduceDimC" => Ok(TOp::ReduceDimC {
            dim: r.parse("dim")?,
            input_layout: read_layout(r)?,
            output_layout: read_layout(r)?,
        }),
        "ReplicateDimC" => Ok(TOp::ReplicateDimC {
            dim: r.parse("dim")?,
            multiple: r.parse("multiple")?,
            input_layout: read_layout(r)?,
            output_layout: read_layout(r)?,
        }),
        "ReorderDimsC" => Ok(TOp::ReorderDimsC {
            permutation: r.list(|r| r.parse("permutation entry"))?,
            input_layout: read_layout(r)?,
            output_layout: read_layout(r)?,
        }),
        "ResizeDimC" => Ok(TOp::ResizeDimC { input_layout: read_layout(r)?, output_layout: read_layout(r)? }),
        "DropDimC" => Ok(TOp::DropDimC {
            dim: r.parse("dim")?,
            input_layout: read_layout(r)?,
            output_layout: read_layout(r)?,
        }),
        "InsertDimC" => Ok(TOp::InsertDimC {
            dim: r.parse("dim")?,
            input_layout: read_layout(r)?,
            output_layout: read_layout(r)?,
        }),
        "StrideC" => Ok(TOp::StrideC {
            strides: r.list(|r| r.parse("stride"))?,
            input_layout: read_layout(r)?,
            output_layout: read_layout(r)?,
        }),
        "MergedStrideC" => Ok(TOp::MergedStrideC {
            strides: r.list(|r| r.parse("stride"))?,
            input_layout: read_layout(r)?,
            output_layout: read_layout(r)?,
        }),
        "CyclicShiftC" => Ok(TOp::CyclicShiftC {
            offset: r.list(|r| r.parse("offset"))?,
            input_layout: read_layout(r)?,
            output_layout: read_layout(r)?,
        }),
        "UnpaddedShiftC" => Ok(TOp::UnpaddedShiftC {
            offset: r.list(|r| r.parse("offset"))?,
            input_layout: read_layout(r)?,
            output_layout: read_layout(r)?,
        }),
        "RotateC" => Ok(TOp::RotateC {
            shift: r.parse("shift")?,
            input_layout: read_layout(r)?,
            output_layout: read_layout(r)?,
        }),
        "ChetRepackC" => Ok(TOp::ChetRepackC { input_layout: read_layout(r)?, output_layout: read_layout(r)? }),
        "LayoutConversionC" => Ok(TOp::LayoutConversionC { input_layout: read_layout(r)?, output_layout: read_layout(r)? }),
        "RescaleC" => Ok(TOp::RescaleC { ct_log_scale: r.parse("ct_log_scale")?, layout: read_layout(r)? }),
        "BootstrapC" => Ok(TOp::BootstrapC { usable_levels: r.parse("usable_levels")?, layout: read_layout(r)? }),
        other => Err(LowerError::structural("serialize::read_top_payload", [], format!("unknown TOp tag `{other}`"))),
    }
}

/// Dump `dag`'s nodes, one per line, in topological order. TOp nodes carry no
/// level info yet, so the payload is just the type tag and its fields.
fn serialize_top_node_line(dag: &TOpDag, id: NodeId) -> String {
    let mut w = TokWriter::new();
    w.tok(id.0.to_string());
    w.list(dag.ancestors(id), |w, a| {
        w.tok(a.0.to_string());
    });
    let op = dag.value(id).expect("live node id has a value");
    w.tok(op.type_name());
    serialize_top_payload(&mut w, op);
    w.list(&dag.parents(id), |w, p| {
        w.tok(p.0.to_string());
    });
    w.finish()
}

pub fn serialize_top_dag(dag: &TOpDag) -> String {
    dag.topological_order()
        .into_iter()
        .map(|id| serialize_top_node_line(dag, id))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Parse a dump produced by [`serialize_top_dag`], restoring every node under
/// its original id.
pub fn deserialize_top_dag(text: &str) -> Result<TOpDag> {
    let mut out = TOpDag::new();

    for line in text.lines().filter(|l| !l.trim().is_empty()) {
        let mut r = TokReader::new(line);
        let id: u32 = r.parse("node id")?;
        let ancestors: Vec<NodeId> = r
            .list(|r| r.parse::<u32>("ancestor id"))?
            .into_iter()
            .map(NodeId)
            .collect();
        let type_name_tok = r.next()?;
        let op = read_top_payload_after_type_name(&mut r, type_name_tok)?;
        let parents: Vec<NodeId> = r
            .list(|r| r.parse::<u32>("parent id"))?
            .into_iter()
            .map(NodeId)
            .collect();
        out.add_node_with_id(NodeId(id), op, parents, ancestors)?;
    }

    Ok(out)
}

/// Dump `dag`'s nodes, one per line, in topological order.
fn serialize_leveled_node_line(dag: &LeveledDag, id: NodeId) -> String {
    let mut w = TokWriter::new();
    w.tok(id.0.to_string());
    w.list(dag.ancestors(id), |w, a| {
        w.tok(a.0.to_string());
    });
    let node = dag.value(id).expect("live node id has a value");
    w.tok(node.op.type_name());
    serialize_level_info(&mut w, &node.info);
    serialize_top_payload(&mut w, &node.op);
    w.list(&dag.parents(id), |w, p| {
        w.tok(p.0.to_string());
    });
    w.finish()
}

pub fn serialize_leveled_dag(dag: &LeveledDag) -> String {
    dag.topological_order()
        .into_iter()
        .map(|id| serialize_leveled_node_line(dag, id))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Parse a dump produced by [`serialize_leveled_dag`], restoring every node
/// under its original id.
pub fn deserialize_leveled_dag(text: &str) -> Result<LeveledDag> {
    let mut out = LeveledDag::new();

    for line in text.lines().filter(|l| !l.trim().is_empty()) {
        let mut r = TokReader::new(line);
        let id: u32 = r.parse("node id")?;
        let ancestors: Vec<NodeId> = r
            .list(|r| r.parse::<u32>("ancestor id"))?
            .into_iter()
            .map(NodeId)
            .collect();
        let type_name_tok = r.next()?;
        let info = read_level_info(&mut r)?;
        let op = read_top_payload_after_type_name(&mut r, type_name_tok)?;
        let parents: Vec<NodeId> = r
            .list(|r| r.parse::<u32>("parent id"))?
            .into_iter()
            .map(NodeId)
            .collect();
        out.add_node_with_id(NodeId(id), LeveledTOp { op, info }, parents, ancestors)?;
    }

    Ok(out)
}

fn serialize_ctop_payload(w: &mut TokWriter, op: &CtOp) {
    match op {
        CtOp::InputC { name, chunk_offset } | CtOp::OutputC { name, chunk_offset } => {
            w.tok(name.clone()).tok(chunk_offset.to_string());
        }
        CtOp::AddCP { chunk } | CtOp::MulCP { chunk } => {
            w.tok(chunk.0.to_string());
        }
        CtOp::AddCS { scalar } | CtOp::MulCS { scalar } => {
            w.tok(scalar.to_string());
        }
        CtOp::RotateC { shift } => {
            w.tok(shift.to_string());
        }
        CtOp::AddCC | CtOp::MulCC | CtOp::RescaleC | CtOp::BootstrapC | CtOp::ZeroC => {}
    }
}

fn serialize_node_line(dag: &CtOpDag, id: NodeId) -> String {
    let mut w = TokWriter::new();
    w.tok(id.0.to_string());
    w.list(dag.ancestors(id), |w, a| {
        w.tok(a.0.to_string());
    });
    let node = dag.value(id).expect("live node id has a value");
    w.tok(node.op.type_name());
    serialize_level_info(&mut w, &node.info);
    serialize_ctop_payload(&mut w, &node.op);
    w.list(&dag.parents(id), |w, p| {
        w.tok(p.0.to_string());
    });
    w.finish()
}

/// Dump `dag`'s nodes, one per line, in topological order.
pub fn serialize_ctop_dag(dag: &CtOpDag) -> String {
    dag.topological_order()
        .into_iter()
        .map(|id| serialize_node_line(dag, id))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Parse a dump produced by [`serialize_ctop_dag`], restoring every node
/// under its original id (via [`crate::dag::Dag::add_node_with_id`]), so
/// `parse(serialise(x)) == x` holds on the dag itself — and a `Provenance`
/// archive dumped from the same dag stays keyed correctly against it.
pub fn deserialize_ctop_dag(text: &str) -> Result<CtOpDag> {
    let mut out = CtOpDag::new();

    for line in text.lines().filter(|l| !l.trim().is_empty()) {
        let mut r = TokReader::new(line);
        let id: u32 = r.parse("node id")?;
        let ancestors: Vec<NodeId> = r
            .list(|r| r.parse::<u32>("ancestor id"))?
            .into_iter()
            .map(NodeId)
            .collect();
        let type_name_tok = r.next()?;
        let info = read_level_info(&mut r)?;
        let op = read_ctop_payload_after_type_name(&mut r, type_name_tok)?;
        let parents: Vec<NodeId> = r
            .list(|r| r.parse::<u32>("parent id"))?
            .into_iter()
            .map(NodeId)
            .collect();

        out.add_node_with_id(NodeId(id), LeveledCtOp { op, info }, parents, ancestors)?;
    }

    Ok(out)
}

fn read_ctop_payload_after_type_name(r: &mut TokReader, type_name: &str) -> Result<CtOp> {
    match type_name {
        "InputC" => Ok(CtOp::InputC { name: r.next()?.to_string(), chunk_offset: r.parse("chunk_offset")? }),
        "OutputC" => Ok(CtOp::OutputC { name: r.next()?.to_string(), chunk_offset: r.parse("chunk_offset")? }),
        "AddCC" => Ok(CtOp::AddCC),
        "AddCP" => Ok(CtOp::AddCP { chunk: ChunkIrHandle(r.parse("chunk handle")?) }),
        "AddCS" => Ok(CtOp::AddCS { scalar: r.parse("scalar")? }),
        "MulCC" => Ok(CtOp::MulCC),
        "MulCP" => Ok(CtOp::MulCP { chunk: ChunkIrHandle(r.parse("chunk handle")?) }),
        "MulCS" => Ok(CtOp::MulCS { scalar: r.parse("scalar")? }),
        "RotateC" => Ok(CtOp::RotateC { shift: r.parse("shift")? }),
        "RescaleC" => Ok(CtOp::RescaleC),
        "BootstrapC" => Ok(CtOp::BootstrapC),
        "ZeroC" => Ok(CtOp::ZeroC),
        other => Err(LowerError::structural("serialize::read_ctop_payload", [], format!("unknown CtOp tag `{other}`"))),
    }
}

/// Dump the chunk dictionary, one `<handle> <chunk line>` per line.
pub fn serialize_chunk_dictionary(program: &CtProgram) -> String {
    let mut handles: Vec<&ChunkIrHandle> = program.chunks().keys().collect();
    handles.sort_by_key(|h| h.0);
    handles
        .into_iter()
        .map(|h| format!("{} {}", h.0, serialize_chunk_ir(&program.chunks()[h])))
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn deserialize_chunk_dictionary(text: &str, program: &mut CtProgram) -> Result<()> {
    for line in text.lines().filter(|l| !l.trim().is_empty()) {
        let (handle_tok, rest) = line
            .split_once(' ')
            .ok_or_else(|| LowerError::structural("serialize::deserialize_chunk_dictionary", [], "missing chunk body"))?;
        let handle: u32 = handle_tok
            .parse()
            .map_err(|_| LowerError::numeric("chunk handle", "could not parse chunk handle"))?;
        let chunk = deserialize_chunk_ir(rest)?;
        program.insert_chunk_at(ChunkIrHandle(handle), chunk);
    }
    Ok(())
}

/// Dump the synthetic constant tensors, one `<name> <count> <value>...` per line.
pub fn serialize_constants(program: &CtProgram) -> String {
    let mut names: Vec<&String> = program.constants().keys().collect();
    names.sort();
    names
        .into_iter()
        .map(|name| {
            let mut w = TokWriter::new();
            w.tok(name.clone());
            w.list(&program.constants()[name], |w, v| {
                w.tok(v.to_string());
            });
            w.finish()
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn deserialize_constants(text: &str, program: &mut CtProgram) -> Result<()> {
    for line in text.lines().filter(|l| !l.trim().is_empty()) {
        let mut r = TokReader::new(line);
        let name = r.next()?.to_string();
        let values: Vec<f64> = r.list(|r| r.parse("constant value"))?;
        program.insert_constant_named(name, values);
    }
    Ok(())
}

/// Dump a [`Provenance`]'s archives: a `# <stage name>` header line per pass,
/// followed by one `<dest_id> <source_ids...>` line per node. Adjacent
/// archives compose by relational join, so the dump is read back in the same
/// stage order it was written.
pub fn serialize_provenance(provenance: &Provenance) -> String {
    let mut lines = Vec::new();
    for stage in provenance.stages() {
        lines.push(format!("# {stage}"));
        let archive = provenance.archive(stage).expect("stage name came from this provenance");
        let mut dest_ids: Vec<&NodeId> = archive.keys().collect();
        dest_ids.sort();
        for id in dest_ids {
            let mut w = TokWriter::new();
            w.tok(id.0.to_string());
            w.list(&archive[id], |w, src| {
                w.tok(src.0.to_string());
            });
            lines.push(w.finish());
        }
    }
    lines.join("\n")
}
