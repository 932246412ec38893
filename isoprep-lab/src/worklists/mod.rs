//! Worklists: typed transfer lists and their generation from a plan

pub mod generator;
pub mod types;

pub use generator::{generate_processing_series, stock_transfer_series};
pub use types::{PlannedTransfer, TransferType, Worklist, WorklistSeries, DILUENT};
