//! The CtOp IR (§4.6): the closed ciphertext-operator family that tensor
//! operators expand into, each node carrying the [`LevelInfo`] it produces,
//! plus the CT program container that owns the plaintext-chunk dictionary.

use std::collections::HashMap;

use crate::context::ProgramContext;
use crate::dag::Dag;
use crate::error::{LowerError, Result};
use crate::level::LevelInfo;
use crate::pipeline::Provenance;

/// A handle to one plaintext chunk: either a literal dense mask, or an
/// indirection resolved against a named frontend tensor at execution time.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum ChunkIr {
    /// A dense `{0, 1}` vector of `size` slots, with every listed index set to 1.
    Mask { size: u64, one_indices: Vec<u64> },
    /// Read from a named frontend tensor at the given flat indices. An entry
    /// of `None` always resolves to zero (the slot is a layout gap).
    Indirection {
        frontend_tensor: String,
        flat_indices: Vec<Option<u64>>,
    },
}

impl ChunkIr {
    /// Produce the concrete plaintext chunk this handle names, consulting
    /// `frontend_tensors` for indirections. The core only constructs and
    /// stores handles; resolving them against real tensor data is the
    /// runtime evaluator's job, not the lowering pipeline's.
    pub fn resolve(&self, frontend_tensors: &HashMap<String, Vec<f64>>) -> Result<Vec<f64>> {
        match self {
            ChunkIr::Mask { size, one_indices } => {
                let mut out = vec![0.0; *size as usize];
                for &i in one_indices {
                    let slot = out.get_mut(i as usize).ok_or_else(|| {
                        LowerError::numeric("chunk ir mask index", format!("one-index {i} out of range for size {size}"))
                    })?;
                    *slot = 1.0;
                }
                Ok(out)
            }
            ChunkIr::Indirection {
                frontend_tensor,
                flat_indices,
            } => {
                let tensor = frontend_tensors.get(frontend_tensor).ok_or_else(|| {
                    LowerError::structural(
                        "ctop::ChunkIr::resolve",
                        [],
                        format!("no frontend tensor named `{frontend_tensor}`"),
                    )
                })?;
                flat_indices
                    .iter()
                    .map(|&idx| match idx {
                        None => Ok(0.0),
                        Some(i) => tensor.get(i as usize).copied().ok_or_else(|| {
                            LowerError::numeric(
                                "chunk ir indirection index",
                                format!("flat index {i} out of range for tensor `{frontend_tensor}`"),
                            )
                        }),
                    })
                    .collect()
            }
        }
    }
}

/// A handle identifying one entry in a [`CtProgram`]'s `ChunkIr` dictionary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct ChunkIrHandle(pub u32);

/// The closed family of ciphertext-level operators a CT program is built
/// from. Every node stands for exactly one ciphertext at one chunk offset of
/// the tensor operator it came from; which offset that is follows from the
/// DAG's own wiring except at the frontend boundary, where `InputC`/`OutputC`
/// record it explicitly.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum CtOp {
    InputC { name: String, chunk_offset: u64 },
    OutputC { name: String, chunk_offset: u64 },
    AddCC,
    AddCP { chunk: ChunkIrHandle },
    AddCS { scalar: f64 },
    MulCC,
    MulCP { chunk: ChunkIrHandle },
    MulCS { scalar: f64 },
    RotateC { shift: i64 },
    RescaleC,
    BootstrapC,
    /// Decrypts to the all-zero chunk. Used where a masked-sum realisation of
    /// a re-addressing TOp needs an explicit identity leg (e.g. a chunk offset
    /// with nothing to contribute in the source layout).
    ZeroC,
}

impl CtOp {
    pub fn type_name(&self) -> &'static str {
        match self {
            CtOp::InputC { .. } => "InputC",
            CtOp::OutputC { .. } => "OutputC",
            CtOp::AddCC => "AddCC",
            CtOp::AddCP { .. } => "AddCP",
            CtOp::AddCS { .. } => "AddCS",
            CtOp::MulCC => "MulCC",
            CtOp::MulCP { .. } => "MulCP",
            CtOp::MulCS { .. } => "MulCS",
            CtOp::RotateC { .. } => "RotateC",
            CtOp::RescaleC => "RescaleC",
            CtOp::BootstrapC => "BootstrapC",
            CtOp::ZeroC => "ZeroC",
        }
    }
}

/// A `CtOp` paired with the level/scale it carries at this point in the program.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct LeveledCtOp {
    pub op: CtOp,
    pub info: LevelInfo,
}

pub type CtOpDag = Dag<LeveledCtOp>;

/// A fully-expanded ciphertext program: the context it was compiled against,
/// its CtOp DAG, and the dictionary of plaintext-chunk handles the DAG's
/// `AddCP`/`MulCP` nodes reference.
#[derive(Debug, Clone)]
pub struct CtProgram {
    ctx: ProgramContext,
    dag: CtOpDag,
    chunks: HashMap<ChunkIrHandle, ChunkIr>,
    next_handle: u32,
    /// Synthetic frontend tensors created to back `AddCP`/`MulCP` constants
    /// that didn't already name a frontend tensor of their own.
    constants: HashMap<String, Vec<f64>>,
    next_const: u32,
    /// The union of every pass's destination-to-source-id archive, assembled
    /// by `compile` so a caller can trace a CtOp node back to its originating
    /// embryo node.
    provenance: Provenance,
}

impl CtProgram {
    pub fn new(ctx: ProgramContext, dag: CtOpDag) -> Self {
        CtProgram {
            ctx,
            dag,
            chunks: HashMap::new(),
            next_handle: 0,
            constants: HashMap::new(),
            next_const: 0,
            provenance: Provenance::new(),
        }
    }

    pub fn provenance(&self) -> &Provenance {
        &self.provenance
    }

    pub fn set_provenance(&mut self, provenance: Provenance) {
        self.provenance = provenance;
    }

    pub fn context(&self) -> &ProgramContext {
        &self.ctx
    }

    pub fn dag(&self) -> &CtOpDag {
        &self.dag
    }

    pub fn dag_mut(&mut self) -> &mut CtOpDag {
        &mut self.dag
    }

    /// Store `chunk` in the dictionary, returning a fresh handle to it. Does
    /// not deduplicate; callers that want sharing (e.g. a mask reused across
    /// several chunk offsets) are expected to cache handles themselves.
    pub fn intern_chunk(&mut self, chunk: ChunkIr) -> ChunkIrHandle {
        let handle = ChunkIrHandle(self.next_handle);
        self.next_handle += 1;
        self.chunks.insert(handle, chunk);
        handle
    }

    pub fn chunk(&self, handle: ChunkIrHandle) -> Option<&ChunkIr> {
        self.chunks.get(&handle)
    }

    pub fn chunks(&self) -> &HashMap<ChunkIrHandle, ChunkIr> {
        &self.chunks
    }

    /// Insert `chunk` at a specific, caller-chosen `handle`, bumping the
    /// internal handle counter past it if needed. Used by the deserializer to
    /// restore a dictionary dumped with its original handle numbering; normal
    /// construction always goes through [`CtProgram::intern_chunk`] instead.
    pub fn insert_chunk_at(&mut self, handle: ChunkIrHandle, chunk: ChunkIr) {
        self.chunks.insert(handle, chunk);
        self.next_handle = self.next_handle.max(handle.0 + 1);
    }

    /// Store a dense constant vector as a synthetic frontend tensor, returning
    /// a handle to an `Indirection` chunk that reads the whole thing back.
    /// Used by the expansion pass to realise a `PlaintextTensor`'s sampled
    /// values without inventing a new `ChunkIr` variant for "inline constant".
    pub fn intern_constant(&mut self, values: Vec<f64>) -> ChunkIrHandle {
        let name = format!("__const{}", self.next_const);
        self.next_const += 1;
        let flat_indices = (0..values.len() as u64).map(Some).collect();
        self.constants.insert(name.clone(), values);
        self.intern_chunk(ChunkIr::Indirection {
            frontend_tensor: name,
            flat_indices,
        })
    }

    /// Synthetic frontend tensors backing interned constants, by name.
    pub fn constants(&self) -> &HashMap<String, Vec<f64>> {
        &self.constants
    }

    /// Restore a named constant dumped with [`CtProgram::intern_constant`]'s
    /// naming scheme, advancing the counter past its suffix if it parses as one.
    pub fn insert_constant_named(&mut self, name: String, values: Vec<f64>) {
        if let Some(n) = name.strip_prefix("__const").and_then(|s| s.parse::<u32>().ok()) {
            self.next_const = self.next_const.max(n + 1);
        }
        self.constants.insert(name, values);
    }

    /// The frontend-tensor dictionary a runtime evaluator should resolve
    /// `ChunkIr::Indirection` against: the caller's own named inputs merged
    /// with the synthetic constants this program interned.
    pub fn resolve_frontend_tensors(&self, inputs: &HashMap<String, Vec<f64>>) -> HashMap<String, Vec<f64>> {
        let mut merged = self.constants.clone();
        merged.extend(inputs.iter().map(|(k, v)| (k.clone(), v.clone())));
        merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::level::{BootstrappingPrecision, Level, LogScale};

    #[test]
    fn mask_resolves_to_a_dense_zero_one_vector() {
        let mask = ChunkIr::Mask { size: 4, one_indices: vec![1, 3] };
        let resolved = mask.resolve(&HashMap::new()).unwrap();
        assert_eq!(resolved, vec![0.0, 1.0, 0.0, 1.0]);
    }

    #[test]
    fn indirection_reads_named_tensor_with_gaps_as_zero() {
        let mut tensors = HashMap::new();
        tensors.insert("x".to_string(), vec![10.0, 20.0, 30.0]);
        let chunk = ChunkIr::Indirection {
            frontend_tensor: "x".into(),
            flat_indices: vec![Some(2), None, Some(0)],
        };
        let resolved = chunk.resolve(&tensors).unwrap();
        assert_eq!(resolved, vec![30.0, 0.0, 10.0]);
    }

    #[test]
    fn indirection_to_unknown_tensor_is_an_error() {
        let chunk = ChunkIr::Indirection { frontend_tensor: "missing".into(), flat_indices: vec![Some(0)] };
        assert!(chunk.resolve(&HashMap::new()).is_err());
    }

    #[test]
    fn interned_chunks_get_distinct_handles() {
        let ctx = ProgramContext::new(2, 20, 4, BootstrappingPrecision::P19).unwrap();
        let mut program = CtProgram::new(ctx, CtOpDag::new());
        let h1 = program.intern_chunk(ChunkIr::Mask { size: 2, one_indices: vec![0] });
        let h2 = program.intern_chunk(ChunkIr::Mask { size: 2, one_indices: vec![1] });
        assert_ne!(h1, h2);
        assert_eq!(program.chunk(h1), Some(&ChunkIr::Mask { size: 2, one_indices: vec![0] }));
    }

    #[test]
    fn ct_program_dag_round_trips_a_node() {
        let ctx = ProgramContext::new(2, 20, 4, BootstrappingPrecision::P19).unwrap();
        let mut program = CtProgram::new(ctx, CtOpDag::new());
        let id = program.dag_mut().add_input(LeveledCtOp {
            op: CtOp::InputC { name: "x".into(), chunk_offset: 0 },
            info: LevelInfo::new(Level(4), LogScale(20)),
        });
        assert!(matches!(program.dag().value(id).unwrap().op, CtOp::InputC { .. }));
    }
}
