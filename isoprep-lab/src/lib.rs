//! # ISO Preparation Lab Library (isoprep-lab)
//!
//! Plans, assigns and executes the preparation of internal sample orders
//! (ISOs) on microtiter plates.
//!
//! **Pipeline:** request layout → preparation plan (planner, sector
//! association) → ISOs and job → stock rack assignment → rack verification
//! → worklist printing or execution.
//!
//! **Storage:** every component reaches pools, tubes, racks and entities
//! through the traits in [`repository`].

pub mod context;
pub mod converter;
pub mod diagnostics;
pub mod error;
pub mod executor;
pub mod model;
pub mod planner;
pub mod repository;
pub mod sectors;
pub mod stock;
pub mod verifier;
pub mod worklists;

pub use context::Context;
pub use diagnostics::Diagnostics;
pub use error::{LabError, LabResult};
