//! Worklist printing and execution
//!
//! Both modes start from the same pre-flight: the ISOs must be in the state
//! the phase expects and the racks must pass verification. Plates missing
//! from the inventory are only stored by a committed execution. Printing renders the transfer jobs into files; execution
//! applies them to the stored racks and commits racks, ISO states and the
//! execution log in one unit.

mod execute;
mod preflight;
mod print;

pub use execute::{execute, run, ExecutionReport};
pub use preflight::{prepare, ExecutionPlan, RackRef, TransferJob};
pub use print::{print_worklists, render, BundleMember, PrintBundle};
