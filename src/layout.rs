//! The layout system: mapping logical tensor indices to (chunk, slot) pairs.

use crate::error::{LowerError, Result};
use crate::shape::{bits_to_represent, Shape, TensorIndex};

/// Identifies bit `bit_index` of the coordinate of dimension `dim`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct DimensionBit {
    /// Index of the dimension this bit belongs to.
    pub dim: usize,
    /// Which bit (0 = least significant) of that dimension's coordinate.
    pub bit_index: u32,
}

/// A single position in a [`TensorLayout`]'s bit sequence: either a real
/// dimension-coordinate bit, or a gap (always decodes to zero).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum LayoutBit {
    /// A real address bit belonging to some dimension.
    Dim(DimensionBit),
    /// An always-zero position; contributes no addressing information.
    Gap,
}

/// A tensor layout: a shape paired with an ordered bit sequence describing how
/// a flat tensor index is split into (chunk offset, slot offset).
///
/// `bits()[0..log_chunk_size]` are the **chunk bits** (they select a slot
/// within one ciphertext); the remainder are the **tensor-offset bits** (they
/// select which ciphertext/chunk). Every `(dim, bit_index)` pair required by
/// the shape must appear exactly once somewhere in the sequence; additional
/// `Gap` entries beyond that required coverage are allowed (they pad the
/// sequence out to `log_chunk_size` when a tensor has fewer natural address
/// bits than the configured chunk size).
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TensorLayout {
    shape: Shape,
    log_chunk_size: u32,
    bits: Vec<LayoutBit>,
}

impl TensorLayout {
    /// Build a layout, validating the coverage invariant: the bit sequence must
    /// be at least `log_chunk_size` long, and every `(dim, bit_index)` pair the
    /// shape requires must appear exactly once.
    pub fn new(shape: Shape, log_chunk_size: u32, bits: Vec<LayoutBit>) -> Result<Self> {
        if !(0..18).contains(&log_chunk_size) {
            return Err(LowerError::numeric(
                "log chunk size",
                format!("log_chunk_size {log_chunk_size} out of bounds [0, 18)"),
            ));
        }
        if bits.len() < log_chunk_size as usize {
            return Err(LowerError::numeric(
                "layout bit coverage",
                "bit sequence shorter than log_chunk_size",
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for bit in &bits {
            if let LayoutBit::Dim(db) = bit {
                if db.dim >= shape.rank() {
                    return Err(LowerError::numeric("layout bit dimension", "dimension index out of range"));
                }
                if db.bit_index >= shape.bits_for_dim(db.dim) {
                    return Err(LowerError::numeric(
                        "layout bit index",
                        "bit index exceeds dimension's required bit width",
                    ));
                }
                if !seen.insert((db.dim, db.bit_index)) {
                    return Err(LowerError::numeric("layout bit uniqueness", "a (dim, bit) pair appears twice"));
                }
            }
        }
        for dim in 0..shape.rank() {
            for bit_index in 0..shape.bits_for_dim(dim) {
                if !seen.contains(&(dim, bit_index)) {
                    return Err(LowerError::numeric(
                        "layout bit coverage",
                        format!("missing coverage for dimension {dim} bit {bit_index}"),
                    ));
                }
            }
        }
        Ok(TensorLayout {
            shape,
            log_chunk_size,
            bits,
        })
    }

    /// The shape this layout maps.
    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    /// `log2` of the chunk size (number of slots per ciphertext).
    pub fn log_chunk_size(&self) -> u32 {
        self.log_chunk_size
    }

    /// Number of slots per ciphertext.
    pub fn chunk_size(&self) -> u64 {
        1u64 << self.log_chunk_size
    }

    /// The authoritative, full bit sequence (chunk bits then tensor-offset bits).
    pub fn bits(&self) -> &[LayoutBit] {
        &self.bits
    }

    /// The low `log_chunk_size` bits: these select a slot within one chunk.
    pub fn chunk_bits(&self) -> &[LayoutBit] {
        &self.bits[..self.log_chunk_size as usize]
    }

    /// The bits above the chunk bits: these select which chunk.
    pub fn tensor_offset_bits(&self) -> &[LayoutBit] {
        &self.bits[self.log_chunk_size as usize..]
    }

    /// Enumerate every chunk offset of this layout. Each offset is represented
    /// as an integer whose bit `k` is the value assigned to
    /// `tensor_offset_bits()[k]`; gap positions are always zero, so only
    /// `2^(non-gap tensor-offset bits)` distinct offsets are produced.
    pub fn chunk_offsets(&self) -> Vec<u64> {
        let offset_bits = self.tensor_offset_bits();
        let non_gap_positions: Vec<usize> = offset_bits
            .iter()
            .enumerate()
            .filter(|(_, b)| matches!(b, LayoutBit::Dim(_)))
            .map(|(i, _)| i)
            .collect();
        let count = 1u64 << non_gap_positions.len();
        (0..count)
            .map(|combo| {
                let mut value = 0u64;
                for (k, &pos) in non_gap_positions.iter().enumerate() {
                    if (combo >> k) & 1 == 1 {
                        value |= 1 << pos;
                    }
                }
                value
            })
            .collect()
    }

    /// Total number of (chunk, slot) pairs this layout enumerates, including
    /// gap slots: `chunk_offsets().len() * chunk_size()`.
    pub fn total_slots(&self) -> u64 {
        self.chunk_offsets().len() as u64 * self.chunk_size()
    }

    /// Decode a full (chunk-region, tensor-offset-region) bit assignment into
    /// a `TensorIndex`, or `None` if the assignment names a gap slot.
    fn decode(&self, slot: u64, chunk_offset: u64) -> Option<TensorIndex> {
        let mut coords = vec![0u32; self.shape.rank()];
        for (i, bit) in self.chunk_bits().iter().enumerate() {
            let physical = (slot >> i) & 1;
            match bit {
                LayoutBit::Gap => {
                    if physical != 0 {
                        return None;
                    }
                }
                LayoutBit::Dim(db) => {
                    coords[db.dim] |= (physical as u32) << db.bit_index;
                }
            }
        }
        for (i, bit) in self.tensor_offset_bits().iter().enumerate() {
            let physical = (chunk_offset >> i) & 1;
            match bit {
                LayoutBit::Gap => {
                    if physical != 0 {
                        return None;
                    }
                }
                LayoutBit::Dim(db) => {
                    coords[db.dim] |= (physical as u32) << db.bit_index;
                }
            }
        }
        for (d, &c) in coords.iter().enumerate() {
            if c >= self.shape.dims()[d] {
                return None;
            }
        }
        TensorIndex::new(self.shape.clone(), coords).ok()
    }

    /// For a given chunk offset (one returned by [`TensorLayout::chunk_offsets`]),
    /// return one entry per slot: `Some(index)` if the slot holds a real tensor
    /// value, `None` if it is a gap (must decrypt to zero).
    pub fn tensor_indices(&self, chunk_offset: u64) -> Vec<Option<TensorIndex>> {
        (0..self.chunk_size())
            .map(|slot| self.decode(slot, chunk_offset))
            .collect()
    }

    /// Locate the (chunk offset, slot) pair that a given tensor index maps to.
    pub fn locate(&self, index: &TensorIndex) -> Result<(u64, u64)> {
        if index.shape() != &self.shape {
            return Err(LowerError::layout_mismatch(
                "layout::locate",
                [],
                "index shape does not match layout shape",
            ));
        }
        let mut slot = 0u64;
        for (i, bit) in self.chunk_bits().iter().enumerate() {
            if let LayoutBit::Dim(db) = bit {
                let bit_val = (index.coords()[db.dim] >> db.bit_index) & 1;
                slot |= (bit_val as u64) << i;
            }
        }
        let mut chunk_offset = 0u64;
        for (i, bit) in self.tensor_offset_bits().iter().enumerate() {
            if let LayoutBit::Dim(db) = bit {
                let bit_val = (index.coords()[db.dim] >> db.bit_index) & 1;
                chunk_offset |= (bit_val as u64) << i;
            }
        }
        Ok((chunk_offset, slot))
    }
}

/// Low-to-high bit order used by both default layout policies: the innermost
/// (last) dimension contributes the least-significant bits, ascending from
/// that dimension's bit 0 up to its top bit, then the next dimension in, and
/// so on out to dimension 0. Padded with leading `Gap` entries when the
/// tensor's natural address width is narrower than `log_chunk_size`.
fn identity_bit_order(shape: &Shape, log_chunk_size: u32) -> Vec<LayoutBit> {
    let mut real = Vec::new();
    for dim in (0..shape.rank()).rev() {
        for bit_index in 0..shape.bits_for_dim(dim) {
            real.push(LayoutBit::Dim(DimensionBit { dim, bit_index }));
        }
    }
    if (real.len() as u32) < log_chunk_size {
        let pad = log_chunk_size as usize - real.len();
        let mut bits = vec![LayoutBit::Gap; pad];
        bits.extend(real);
        bits
    } else {
        real
    }
}

/// Build the default **fill-gaps** layout for `shape`: the identity bit order,
/// padded with gaps as needed. Downstream passes may later replace some of
/// these bits with gaps (e.g. a stride operator discarding precision); the
/// [`fill_gaps_bits`] utility is what repopulates such gaps.
pub fn default_layout_fill_gaps(shape: Shape, log_chunk_size: u32) -> Result<TensorLayout> {
    let bits = identity_bit_order(&shape, log_chunk_size);
    TensorLayout::new(shape, log_chunk_size, bits)
}

/// Build the default **CHET row-major** layout: identical initial bit order to
/// [`default_layout_fill_gaps`]; the CHET policy simply never calls
/// [`fill_gaps_bits`] afterwards, so any gaps introduced by later rewrites stay
/// gaps.
pub fn default_layout_chet(shape: Shape, log_chunk_size: u32) -> Result<TensorLayout> {
    let bits = identity_bit_order(&shape, log_chunk_size);
    TensorLayout::new(shape, log_chunk_size, bits)
}

/// Repopulate `Gap` entries within the tensor-offset region of `bits` using
/// whichever `(dim, bit)` pairs `shape` requires but `bits` does not yet
/// contain, preferring to extend an existing contiguous run of the same
/// dimension immediately below the gap. Chunk-region gaps are left untouched
/// (see the design notes on strided layouts being treated as non-invertible).
///
/// `bits` need not already satisfy [`TensorLayout`]'s full-coverage invariant;
/// this is the utility that gets it there. Any gap left unfilled (because no
/// candidate dimension bit remains) is returned as-is.
pub fn fill_gaps_bits(shape: &Shape, log_chunk_size: u32, bits: &[LayoutBit]) -> Vec<LayoutBit> {
    let mut placed: std::collections::HashSet<(usize, u32)> = std::collections::HashSet::new();
    for bit in bits {
        if let LayoutBit::Dim(db) = bit {
            placed.insert((db.dim, db.bit_index));
        }
    }
    let mut missing: Vec<(usize, u32)> = Vec::new();
    for dim in 0..shape.rank() {
        for bit_index in 0..shape.bits_for_dim(dim) {
            if !placed.contains(&(dim, bit_index)) {
                missing.push((dim, bit_index));
            }
        }
    }
    // Deterministic order: by dimension, then by bit index descending (mirrors
    // the high-bit-first-within-a-dimension convention).
    missing.sort_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1)));

    let mut new_bits = bits.to_vec();
    let chunk_len = (log_chunk_size as usize).min(new_bits.len());

    for pos in chunk_len..new_bits.len() {
        if !matches!(new_bits[pos], LayoutBit::Gap) {
            continue;
        }
        let preferred_dim = if pos > 0 {
            match new_bits[pos - 1] {
                LayoutBit::Dim(db) => Some(db.dim),
                LayoutBit::Gap => None,
            }
        } else {
            None
        };

        let chosen_index = preferred_dim
            .and_then(|dim| missing.iter().position(|(d, _)| *d == dim))
            .or(if missing.is_empty() { None } else { Some(0) });

        if let Some(idx) = chosen_index {
            let (dim, bit_index) = missing.remove(idx);
            new_bits[pos] = LayoutBit::Dim(DimensionBit { dim, bit_index });
        }
    }

    new_bits
}

/// Apply [`fill_gaps_bits`] to an already-constructed layout. This is a no-op
/// whenever `layout` already has full coverage (the common case once a layout
/// reaches the public API), and is exercised for real by the layout pass while
/// it is still assembling a candidate bit sequence for a stride-derived view.
pub fn fill_gaps(layout: &TensorLayout) -> Result<TensorLayout> {
    let shape = layout.shape().clone();
    let new_bits = fill_gaps_bits(&shape, layout.log_chunk_size(), layout.bits());
    TensorLayout::new(shape, layout.log_chunk_size(), new_bits)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_slot_count_matches_invariant() {
        let shape = Shape::new(vec![4, 4]).unwrap();
        let layout = default_layout_fill_gaps(shape, 2).unwrap();
        assert_eq!(layout.chunk_offsets().len() as u64 * layout.chunk_size(), layout.total_slots());
    }

    #[test]
    fn every_valid_tensor_index_appears_exactly_once() {
        let shape = Shape::new(vec![3, 5]).unwrap();
        let layout = default_layout_fill_gaps(shape.clone(), 3).unwrap();
        let mut seen = std::collections::HashSet::new();
        let mut gap_count = 0u64;
        for offset in layout.chunk_offsets() {
            for slot in layout.tensor_indices(offset) {
                match slot {
                    Some(idx) => assert!(seen.insert(idx.flat()), "index visited twice"),
                    None => gap_count += 1,
                }
            }
        }
        assert_eq!(seen.len() as u64, shape.value_count());
        assert_eq!(gap_count, layout.total_slots() - shape.value_count());
    }

    #[test]
    fn small_shape_with_large_chunk_pads_with_gaps() {
        // shape [8] needs 3 bits; force a 16-slot chunk (log_chunk_size = 4).
        let shape = Shape::new(vec![8]).unwrap();
        let layout = default_layout_fill_gaps(shape.clone(), 4).unwrap();
        assert_eq!(layout.bits().len(), 4);
        assert_eq!(layout.chunk_offsets(), vec![0]);
        assert_eq!(layout.total_slots(), 16);
        let gaps = layout
            .tensor_indices(0)
            .into_iter()
            .filter(|s| s.is_none())
            .count();
        assert_eq!(gaps as u64, 16 - shape.value_count());
    }

    #[test]
    fn locate_and_tensor_indices_agree() {
        let shape = Shape::new(vec![3, 5]).unwrap();
        let layout = default_layout_fill_gaps(shape.clone(), 3).unwrap();
        for offset in layout.chunk_offsets() {
            for (slot, maybe_idx) in layout.tensor_indices(offset).into_iter().enumerate() {
                if let Some(idx) = maybe_idx {
                    let (located_offset, located_slot) = layout.locate(&idx).unwrap();
                    assert_eq!(located_offset, offset);
                    assert_eq!(located_slot, slot as u64);
                }
            }
        }
    }

    #[test]
    fn fill_gaps_bits_repopulates_displaced_dimension_bit() {
        let shape = Shape::new(vec![8]).unwrap();
        // Start from a fully-covered sequence, then simulate a stride pass
        // discarding the dimension's bit 0 by replacing it with a gap and
        // appending a fresh gap slot for it to be relocated into.
        let mut bits = identity_bit_order(&shape, 3);
        assert_eq!(bits.len(), 3);
        bits[0] = LayoutBit::Gap;
        bits.push(LayoutBit::Gap);

        let filled = fill_gaps_bits(&shape, 3, &bits);
        // The chunk region (first 3 bits) is untouched; the displaced bit 0
        // is relocated into the newly appended tensor-offset gap.
        assert_eq!(filled[0], LayoutBit::Gap);
        assert_eq!(filled[3], LayoutBit::Dim(DimensionBit { dim: 0, bit_index: 0 }));
        // Result is now fully covered again and builds a valid layout.
        assert!(TensorLayout::new(shape, 3, filled).is_ok());
    }

    #[test]
    fn layout_rejects_bad_chunk_size_bounds() {
        let shape = Shape::new(vec![4]).unwrap();
        assert!(TensorLayout::new(shape.clone(), 18, identity_bit_order(&shape, 2)).is_err());
    }
}
