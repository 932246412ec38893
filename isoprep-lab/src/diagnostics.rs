//! Error collector shared by the converter, planner, assigner and verifier
//!
//! Components run to completion per input and push every problem they find.
//! The caller turns the collection into a single result at the end.

use crate::error::{LabError, LabResult};
use tracing::warn;

#[derive(Debug, Default)]
pub struct Diagnostics {
    errors: Vec<LabError>,
    warnings: Vec<String>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, error: LabError) {
        self.errors.push(error);
    }

    /// Record the error of a failed step and continue
    pub fn record<T>(&mut self, result: LabResult<T>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(error) => {
                self.errors.push(error);
                None
            }
        }
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        let message = message.into();
        warn!("{}", message);
        self.warnings.push(message);
    }

    pub fn errors(&self) -> &[LabError] {
        &self.errors
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    /// `Ok(value)` if nothing was collected; a single error is returned as
    /// is, several become [`LabError::PlanFailed`]
    pub fn into_result<T>(self, value: T) -> LabResult<T> {
        let mut errors = self.errors;
        match errors.len() {
            0 => Ok(value),
            1 => Err(errors.remove(0)),
            _ => Err(LabError::PlanFailed(errors)),
        }
    }

    /// Fail with everything collected so far (no-op when clean)
    pub fn check(&mut self) -> LabResult<()> {
        let collected = std::mem::take(&mut self.errors);
        Diagnostics {
            errors: collected,
            warnings: Vec::new(),
        }
        .into_result(())
    }
}
