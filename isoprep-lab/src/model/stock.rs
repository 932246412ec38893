//! Stock rack layouts: one position per participating stock tube

use crate::model::layout::RackLayout;
use crate::model::pool::PoolId;
use crate::model::position::{LayoutPosition, TransferTarget, WellContent};
use crate::model::rack::RackPosition;
use serde::{Deserialize, Serialize};

/// Where a tube was picked from (for the picking list)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TubeOrigin {
    pub rack_barcode: String,
    pub position: RackPosition,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StockRackPosition {
    pub position: RackPosition,
    content: WellContent,
    pub tube_barcode: String,
    /// Targets qualified by plate marker
    pub transfer_targets: Vec<TransferTarget>,
    #[serde(default)]
    pub origin: Option<TubeOrigin>,
}

impl StockRackPosition {
    pub fn new(position: RackPosition, pool: PoolId, tube_barcode: impl Into<String>) -> Self {
        Self {
            position,
            content: WellContent::Fixed { pool },
            tube_barcode: tube_barcode.into(),
            transfer_targets: Vec::new(),
            origin: None,
        }
    }

    pub fn pool(&self) -> PoolId {
        self.content.pool().unwrap_or_default()
    }
}

impl LayoutPosition for StockRackPosition {
    fn rack_position(&self) -> RackPosition {
        self.position
    }

    fn content(&self) -> &WellContent {
        &self.content
    }
}

pub type StockRackLayout = RackLayout<StockRackPosition>;
