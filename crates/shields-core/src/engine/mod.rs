//! Engine - compiled filter-list engines
//!
//! One [`EngineManager`] per engine type:
//! - Tracks the downloaded filter lists for its engine
//! - Debounces bursts of list updates into a single compile
//! - Skips compiles whose inputs match the live engine
//! - Persists compiled engines so the next launch can skip compiling

mod cache;
mod compiled;
mod debounce;
mod group;
mod manager;

pub use cache::*;
pub use compiled::*;
pub use debounce::*;
pub use group::*;
pub use manager::*;
