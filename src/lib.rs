// Library interface for applauncherd
// The daemon binary, the invoker and the benchmarks share these modules

pub mod booster;
pub mod daemon;
pub mod error;
pub mod logging;
pub mod signal;
pub mod single_instance;
