//! Error types for isoprep-lab
//!
//! Every failure kind carries structured details (positions, pools, volumes)
//! so a failed run can be rendered as a report that names what to fix.

use crate::converter::Defect;
use crate::model::{IsoStatus, PoolId};
use isoprep_common::labels::LabelError;
use thiserror::Error;

/// Result type for lab operations
pub type LabResult<T> = Result<T, LabError>;

/// Lab error type
#[derive(Debug, Error)]
pub enum LabError {
    /// A position was constructed with attributes its type does not allow
    #[error("Invalid position {position}: {reason}")]
    InvalidPosition { position: String, reason: String },

    /// A layout operation would break a layout invariant
    #[error("Layout invariant violated: {0}")]
    LayoutInvariantViolation(String),

    #[error("Unknown pool: {0}")]
    UnknownPool(PoolId),

    #[error("Concentration {concentration} nM exceeds stock concentration {stock_concentration} nM of {pool} at {}", .positions.join(", "))]
    ConcentrationExceedsStock {
        pool: String,
        concentration: f64,
        stock_concentration: f64,
        positions: Vec<String>,
    },

    #[error("Dilution from {source_concentration} nM to {target_concentration} nM for {pool} is not reachable within {max_steps} steps at {}", .positions.join(", "))]
    UnreachableDilution {
        pool: String,
        source_concentration: f64,
        target_concentration: f64,
        max_steps: u32,
        positions: Vec<String>,
    },

    #[error("Sector mismatch for sectors {sectors:?}: {reason}")]
    SectorMismatch { sectors: Vec<u8>, reason: String },

    #[error("Inconsistent values in sector {sector}: {reason}")]
    InconsistentSectorConcentration { sector: u8, reason: String },

    #[error("No empty position left for an intermediate dilution of {pool} (needed for {})", .positions.join(", "))]
    NoRoomForIntermediate { pool: String, positions: Vec<String> },

    #[error("No stock tube found for pool {pool}")]
    TubeNotFound { pool: PoolId },

    #[error("Every stock tube of pool {pool} with enough volume is already in use: {}", .tubes.join(", "))]
    TubeInUse { pool: PoolId, tubes: Vec<String> },

    #[error("Insufficient volume for pool {pool}: required {required} µl, available {available} µl")]
    InsufficientVolume {
        pool: PoolId,
        required: f64,
        available: f64,
    },

    #[error("Verification of rack {rack} failed:\n  {}", .discrepancies.join("\n  "))]
    RackVerificationFailed { rack: String, discrepancies: Vec<String> },

    #[error("Unexpected status for {entity}: {found} (expected {expected})")]
    UnexpectedStatus {
        entity: String,
        found: IsoStatus,
        expected: IsoStatus,
    },

    #[error("Duplicate transfer target {target} at {position}")]
    DuplicateTransferTarget { position: String, target: String },

    #[error("Unknown label: {0}")]
    UnknownLabel(String),

    /// The converter found defects; the layout is rejected as a whole
    #[error("Conversion of {layout} layout failed:\n  {}", .defects.iter().map(|d| d.to_string()).collect::<Vec<_>>().join("\n  "))]
    ConversionFailed { layout: String, defects: Vec<Defect> },

    #[error("Volume {volume} µl at {position} exceeds the maximum well volume {max_volume} µl")]
    VolumeExceedsCapacity {
        position: String,
        volume: f64,
        max_volume: f64,
    },

    #[error("No barcode given for stock rack {0}")]
    MissingStockRackBarcode(String),

    #[error("Not enough library plates: {required} required, {available} available")]
    LibraryPlatesExhausted { required: usize, available: usize },

    #[error("Not enough floating pools: {required} required, {available} available")]
    FloatingPoolsExhausted { required: usize, available: usize },

    #[error("An executing user is required")]
    MissingUser,

    #[error("Execution cancelled")]
    Cancelled,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Several errors collected by one component
    #[error("{} error(s):\n{}", .0.len(), render_report(.0))]
    PlanFailed(Vec<LabError>),

    /// isoprep-common error
    #[error("Common error: {0}")]
    Common(#[from] isoprep_common::Error),

    #[error("Rendering failed: {0}")]
    Render(#[from] std::fmt::Error),
}

impl From<LabelError> for LabError {
    fn from(err: LabelError) -> Self {
        LabError::UnknownLabel(err.to_string())
    }
}

impl From<sqlx::Error> for LabError {
    fn from(err: sqlx::Error) -> Self {
        LabError::Common(isoprep_common::Error::Database(err))
    }
}

impl From<serde_json::Error> for LabError {
    fn from(err: serde_json::Error) -> Self {
        LabError::Common(isoprep_common::Error::Serialization(err))
    }
}

impl From<std::io::Error> for LabError {
    fn from(err: std::io::Error) -> Self {
        LabError::Common(isoprep_common::Error::Io(err))
    }
}

impl From<csv::Error> for LabError {
    fn from(err: csv::Error) -> Self {
        LabError::Common(isoprep_common::Error::Io(err.into()))
    }
}

/// Multi-line report, one bullet per error
pub fn render_report(errors: &[LabError]) -> String {
    errors
        .iter()
        .map(|e| format!("- {}", e.to_string().replace('\n', "\n  ")))
        .collect::<Vec<_>>()
        .join("\n")
}
