//! Program-wide parameters and per-compilation pass configuration.
//!
//! Construction is where every numeric precondition named in the error-handling
//! design is enforced: a bad `ProgramContext` or `PassConfig` never reaches a pass.

use crate::error::{LowerError, Result};
use crate::level::BootstrappingPrecision;

/// Parameters describing the target CKKS backend, fixed for one compilation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgramContext {
    log_chunk_size: u32,
    ct_log_scale: u32,
    usable_levels: u32,
    bootstrapping_precision: BootstrappingPrecision,
}

impl ProgramContext {
    pub fn new(
        log_chunk_size: u32,
        ct_log_scale: u32,
        usable_levels: u32,
        bootstrapping_precision: BootstrappingPrecision,
    ) -> Result<Self> {
        if !(0..18).contains(&log_chunk_size) {
            return Err(LowerError::numeric(
                "log chunk size",
                format!("log_chunk_size {log_chunk_size} out of bounds [0, 18)"),
            ));
        }
        if ct_log_scale == 0 {
            return Err(LowerError::numeric("ct log scale", "ct_log_scale must be positive"));
        }
        if usable_levels == 0 {
            return Err(LowerError::numeric("usable levels", "usable_levels must be at least 1"));
        }
        Ok(ProgramContext {
            log_chunk_size,
            ct_log_scale,
            usable_levels,
            bootstrapping_precision,
        })
    }

    pub fn log_chunk_size(&self) -> u32 {
        self.log_chunk_size
    }

    pub fn chunk_size(&self) -> u64 {
        1u64 << self.log_chunk_size
    }

    pub fn ct_log_scale(&self) -> u32 {
        self.ct_log_scale
    }

    pub fn usable_levels(&self) -> u32 {
        self.usable_levels
    }

    pub fn bootstrapping_precision(&self) -> BootstrappingPrecision {
        self.bootstrapping_precision
    }

    /// The waterline: a node's log scale must stay strictly below this.
    pub fn scale_waterline(&self) -> u32 {
        2 * self.ct_log_scale
    }
}

/// Which default layout policy the layout pass uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayoutPolicy {
    FillGaps,
    Chet { row_major_hack: bool },
}

/// Which leveling strategy the leveling pass uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LevelingPolicy {
    /// The full dynamic-program bootstrap placement (§4.4).
    Dp,
    /// Bootstrap eagerly whenever a node would otherwise underflow; no DP.
    Lazy,
    /// Never bootstrap; leveling fails with `LevelUnderflow` if the program needs one.
    Noop,
    /// CHET's own lazy variant: bootstrap at the chokepoint immediately below underflow.
    ChetLazy,
}

/// Which ciphertext-expansion policy the CtOp pass uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CtOpPolicy {
    /// Expand every TOp to its CtOp realisation.
    Basic,
    /// Skip expansion; used by tooling that only needs the leveled TOp DAG.
    Dummy,
}

/// Toggles and bounds governing the optimiser passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PassConfig {
    layout_policy: LayoutPolicy,
    leveling_policy: LevelingPolicy,
    ctop_policy: CtOpPolicy,
    repack_shower: bool,
    max_tentacles: u32,
}

impl PassConfig {
    pub fn new(
        layout_policy: LayoutPolicy,
        leveling_policy: LevelingPolicy,
        ctop_policy: CtOpPolicy,
        repack_shower: bool,
        max_tentacles: u32,
    ) -> Result<Self> {
        if max_tentacles == 0 || !max_tentacles.is_power_of_two() {
            return Err(LowerError::numeric(
                "max tentacles",
                format!("max_tentacles {max_tentacles} must be a positive power of two"),
            ));
        }
        Ok(PassConfig {
            layout_policy,
            leveling_policy,
            ctop_policy,
            repack_shower,
            max_tentacles,
        })
    }

    pub fn layout_policy(&self) -> LayoutPolicy {
        self.layout_policy
    }

    pub fn leveling_policy(&self) -> LevelingPolicy {
        self.leveling_policy
    }

    pub fn ctop_policy(&self) -> CtOpPolicy {
        self.ctop_policy
    }

    pub fn repack_shower(&self) -> bool {
        self.repack_shower
    }

    pub fn max_tentacles(&self) -> u32 {
        self.max_tentacles
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn program_context_rejects_out_of_range_chunk_size() {
        assert!(ProgramContext::new(18, 30, 4, BootstrappingPrecision::P19).is_err());
    }

    #[test]
    fn program_context_accepts_valid_parameters() {
        assert!(ProgramContext::new(3, 30, 4, BootstrappingPrecision::P19).is_ok());
    }

    #[test]
    fn pass_config_rejects_non_power_of_two_max_tentacles() {
        assert!(PassConfig::new(
            LayoutPolicy::FillGaps,
            LevelingPolicy::Dp,
            CtOpPolicy::Basic,
            false,
            3
        )
        .is_err());
    }

    #[test]
    fn bootstrapping_precision_round_trips_through_bits() {
        assert_eq!(BootstrappingPrecision::from_bits(26).unwrap().bits(), 26);
        assert!(BootstrappingPrecision::from_bits(20).is_err());
    }
}
