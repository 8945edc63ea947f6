//! Layout conversion: realising a change of layout via masked rotation and
//! summation, and the decomposer that keeps a conversion's cost bounded.

use std::collections::HashMap;

use crate::error::{LowerError, Result};
use crate::layout::TensorLayout;

/// A conversion from one layout to another of the same shape and chunk size.
#[derive(Debug, Clone, PartialEq)]
pub struct LayoutConversion {
    input: TensorLayout,
    output: TensorLayout,
}

impl LayoutConversion {
    pub fn new(input: TensorLayout, output: TensorLayout) -> Result<Self> {
        if input.shape() != output.shape() {
            return Err(LowerError::layout_mismatch(
                "layout_conversion::new",
                [],
                "conversion endpoints must share a shape",
            ));
        }
        if input.log_chunk_size() != output.log_chunk_size() {
            return Err(LowerError::layout_mismatch(
                "layout_conversion::new",
                [],
                "conversion endpoints must share a chunk size",
            ));
        }
        Ok(LayoutConversion { input, output })
    }

    pub fn input(&self) -> &TensorLayout {
        &self.input
    }

    pub fn output(&self) -> &TensorLayout {
        &self.output
    }

    /// Count of chunk-bit positions at which the two layouts differ.
    fn chunk_bit_discrepancy(&self) -> u32 {
        self.input
            .chunk_bits()
            .iter()
            .zip(self.output.chunk_bits())
            .filter(|(a, b)| a != b)
            .count() as u32
    }

    /// `input_chunks * 2^d`, an upper bound on the rotations a realisation needs.
    pub fn tentacle_estimate(&self) -> u64 {
        let input_chunks = self.input.chunk_offsets().len() as u64;
        input_chunks * (1u64 << self.chunk_bit_discrepancy())
    }

    /// Split this conversion into a chain whose individual tentacle estimates
    /// are each at most `max_tentacles`, by resolving one chunk-bit discrepancy
    /// (highest position first) per intermediate step. Every two adjacent
    /// layouts in the chain are valid `TensorLayout`s for the same shape and
    /// chunk size; since both endpoints are permutations of the same bit
    /// multiset (guaranteed by `TensorLayout`'s coverage invariant), each step
    /// is a pure position swap.
    pub fn decompose(&self, max_tentacles: u32) -> Result<Vec<LayoutConversion>> {
        if self.tentacle_estimate() <= max_tentacles as u64 {
            return Ok(vec![self.clone()]);
        }

        let shape = self.input.shape().clone();
        let log_chunk_size = self.input.log_chunk_size();
        let target_bits = self.output.bits().to_vec();
        let mut current_bits = self.input.bits().to_vec();
        let mut current_layout = self.input.clone();

        let mut steps = Vec::new();
        loop {
            let chunk_len = log_chunk_size as usize;
            let discrepancies: Vec<usize> = (0..chunk_len)
                .filter(|&i| current_bits[i] != target_bits[i])
                .collect();
            if discrepancies.is_empty() {
                break;
            }
            let pos = *discrepancies.iter().max().expect("non-empty");
            let target_bit = target_bits[pos];
            let j = current_bits
                .iter()
                .position(|b| *b == target_bit)
                .expect("target bit exists somewhere in the shared multiset");
            current_bits.swap(pos, j);

            let next_layout = TensorLayout::new(shape.clone(), log_chunk_size, current_bits.clone())?;
            let step = LayoutConversion::new(current_layout.clone(), next_layout.clone())?;
            let remaining_estimate = LayoutConversion::new(next_layout.clone(), self.output.clone())?.tentacle_estimate();
            steps.push(step);
            current_layout = next_layout;
            if remaining_estimate <= max_tentacles as u64 {
                break;
            }
        }
        if current_layout != self.output {
            steps.push(LayoutConversion::new(current_layout, self.output.clone())?);
        }
        Ok(steps)
    }

    /// A simple, correct default realisation: for each output chunk offset,
    /// group the slots it needs by (source chunk offset, rotation amount),
    /// yielding one masked-rotate-and-accumulate step per group. This is not
    /// rotation-count-optimal; callers needing the optimal rotation/mask
    /// search described in the design notes may substitute their own.
    pub fn realize(&self) -> Result<Vec<ConversionPlan>> {
        let chunk_size = self.output.chunk_size();
        let mut plans = Vec::new();
        for oc in self.output.chunk_offsets() {
            let out_indices = self.output.tensor_indices(oc);
            let mut groups: HashMap<(u64, i64), Vec<usize>> = HashMap::new();
            for (slot, maybe_idx) in out_indices.iter().enumerate() {
                if let Some(idx) = maybe_idx {
                    let (ic, is) = self.input.locate(idx)?;
                    let n = chunk_size as i64;
                    let shift = ((is as i64 - slot as i64) % n + n) % n;
                    groups.entry((ic, shift)).or_default().push(slot);
                }
            }
            let mut steps: Vec<ConversionStep> = groups
                .into_iter()
                .map(|((input_chunk_offset, rotation), slots)| {
                    let mut mask = vec![false; chunk_size as usize];
                    for s in slots {
                        mask[s] = true;
                    }
                    ConversionStep {
                        input_chunk_offset,
                        rotation,
                        mask,
                    }
                })
                .collect();
            steps.sort_by_key(|s| (s.input_chunk_offset, s.rotation));
            plans.push(ConversionPlan {
                output_chunk_offset: oc,
                steps,
            });
        }
        Ok(plans)
    }
}

/// One contribution to an output chunk: rotate the named input chunk left by
/// `rotation` slots, then keep only the slots where `mask` is true.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversionStep {
    pub input_chunk_offset: u64,
    pub rotation: i64,
    pub mask: Vec<bool>,
}

/// All the steps that sum (after a final zeroing mask over any remaining gaps)
/// to one output chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversionPlan {
    pub output_chunk_offset: u64,
    pub steps: Vec<ConversionStep>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{default_layout_chet, default_layout_fill_gaps};
    use crate::shape::{Shape, TensorIndex};

    #[test]
    fn tentacle_estimate_is_zero_discrepancy_for_identical_layouts() {
        let shape = Shape::new(vec![4, 4]).unwrap();
        let layout = default_layout_fill_gaps(shape, 2).unwrap();
        let conv = LayoutConversion::new(layout.clone(), layout).unwrap();
        assert_eq!(conv.tentacle_estimate(), conv.input().chunk_offsets().len() as u64);
    }

    #[test]
    fn decompose_respects_the_requested_bound() {
        let shape = Shape::new(vec![4, 4]).unwrap();
        let input = default_layout_fill_gaps(shape.clone(), 2).unwrap();
        // Build an output layout by reversing the bit order (same multiset, new permutation).
        let mut bits = input.bits().to_vec();
        bits.reverse();
        let output = TensorLayout::new(shape, 2, bits).unwrap();
        let conv = LayoutConversion::new(input, output).unwrap();
        for step in conv.decompose(2).unwrap() {
            assert!(step.tentacle_estimate() <= 2);
        }
    }

    #[test]
    fn realize_maps_every_value_to_its_output_position() {
        let shape = Shape::new(vec![4]).unwrap();
        let input = default_layout_fill_gaps(shape.clone(), 2).unwrap();
        let output = default_layout_chet(shape.clone(), 2).unwrap();
        let conv = LayoutConversion::new(input.clone(), output.clone()).unwrap();
        let plans = conv.realize().unwrap();
        // Every valid tensor index must be produced by exactly one step across all plans.
        let mut produced = std::collections::HashSet::new();
        for plan in &plans {
            for step in &plan.steps {
                for (slot, hit) in step.mask.iter().enumerate() {
                    if *hit {
                        produced.insert((plan.output_chunk_offset, slot));
                    }
                }
            }
        }
        for flat in 0..shape.value_count() {
            let idx = TensorIndex::from_flat(shape.clone(), flat).unwrap();
            let loc = output.locate(&idx).unwrap();
            assert!(produced.contains(&loc));
        }
    }
}
