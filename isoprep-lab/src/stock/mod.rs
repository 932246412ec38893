//! Stock racks: tube choice, rack layouts and tube moves
//!
//! The assigner picks one stock tube per pool and stock rack, lays the tubes
//! out and attaches the racks to the job and its ISOs. Picking then moves
//! the chosen tubes from their storage racks into the stock racks.

pub mod assigner;
pub mod picking;

pub use assigner::{assign_stock_racks, StockRackBarcodes};
pub use picking::{apply_tube_moves, TubeMove};
