//! Library half of the `stratum-sim` binary, split out so integration
//! tests under `tests/` can drive whole scenarios the way `main.rs` does.

pub mod config;
pub mod scenario;
