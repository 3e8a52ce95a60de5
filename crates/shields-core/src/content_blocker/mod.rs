//! Content Blocker - native rule lists
//!
//! Filter lists (and the bundled generic lists) are converted into the
//! rule format of the native content blocker, stored per blocking mode and
//! loaded on demand for the pages that need them.

mod bundled;
mod convert;
mod manager;
mod store;

pub use bundled::*;
pub use convert::*;
pub use manager::*;
pub use store::*;
