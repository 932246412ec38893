//! Position and layout model
//!
//! Typed well contents, plate positions, rack layouts with their
//! invariants, the preparation plan, entities and physical inventory.

pub mod entities;
pub mod inventory;
pub mod lab;
pub mod layout;
pub mod pool;
pub mod position;
pub mod rack;
pub mod request;
pub mod stock;

pub use entities::{Entity, Iso, IsoJob, IsoStatus, PlateRef, StockRack};
pub use inventory::{Container, Rack, RackKind, Sample, TubeCandidate};
pub use lab::{FinalLayout, PreparationPlan, PrepLayout, PrepPlate, ProcessingOrder, StockRackPlan};
pub use layout::RackLayout;
pub use pool::{Placeholder, Pool, PoolId, MISSING_FLOATING};
pub use position::{
    FinalPosition, LabIsoPosition, LabPosition, LayoutPosition, PositionType, PrepPosition, ReagentKey,
    RequestPosition, TransferTarget, WellContent,
};
pub use rack::{RackPosition, RackShape, NUMBER_SECTORS};
pub use request::{IsoRequest, IsoRequestRecord, LibraryPlate, LibraryReference, Scenario};
pub use stock::{StockRackLayout, StockRackPosition, TubeOrigin};
