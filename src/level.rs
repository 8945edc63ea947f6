//! Scale and level bookkeeping shared by the rescaling and leveling passes.

use crate::error::{LowerError, Result};

/// `log2` of a CKKS scale factor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct LogScale(pub u32);

/// Remaining multiplicative depth before a ciphertext must be bootstrapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct Level(pub u32);

/// A ciphertext's level and scale, carried together from the leveling pass onward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct LevelInfo {
    pub level: Level,
    pub log_scale: LogScale,
}

impl LevelInfo {
    pub fn new(level: Level, log_scale: LogScale) -> Self {
        LevelInfo { level, log_scale }
    }
}

/// The discrete set of bootstrapping precisions the backend supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum BootstrappingPrecision {
    P19,
    P26,
    P32,
}

impl BootstrappingPrecision {
    pub fn bits(self) -> u32 {
        match self {
            BootstrappingPrecision::P19 => 19,
            BootstrappingPrecision::P26 => 26,
            BootstrappingPrecision::P32 => 32,
        }
    }

    pub fn from_bits(bits: u32) -> Result<Self> {
        match bits {
            19 => Ok(BootstrappingPrecision::P19),
            26 => Ok(BootstrappingPrecision::P26),
            32 => Ok(BootstrappingPrecision::P32),
            other => Err(LowerError::numeric(
                "bootstrapping precision",
                format!("{other} is not one of {{19, 26, 32}}"),
            )),
        }
    }
}
