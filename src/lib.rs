//! Lowering pipeline from tensor dataflow graphs to leveled CKKS ciphertext
//! programs: layout assignment, waterline rescaling, DP-based bootstrap
//! placement, and tensor-to-ciphertext expansion.

mod context;
mod ctop;
mod ctop_opts;
mod dag;
mod depth;
mod embryo;
mod error;
mod expand;
mod layout;
mod layout_conversion;
mod layout_opts;
mod layout_pass;
mod level;
mod leveling;
mod leveling_opts;
mod pipeline;
mod rescale;
mod serialize;
mod shape;
mod top;

pub use context::*;
pub use ctop::*;
pub use ctop_opts::*;
pub use dag::*;
pub use depth::*;
pub use embryo::*;
pub use error::*;
pub use expand::*;
pub use layout::*;
pub use layout_conversion::*;
pub use layout_opts::*;
pub use layout_pass::*;
pub use level::*;
pub use leveling::*;
pub use leveling_opts::*;
pub use pipeline::*;
pub use rescale::*;
pub use serialize::*;
pub use shape::*;
pub use top::*;
