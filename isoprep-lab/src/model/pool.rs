//! Reagent pools and floating placeholders

use crate::error::{LabError, LabResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Pool identifier
pub type PoolId = u64;

/// Placeholder value persisted for a floating position whose pool was not bound
pub const MISSING_FLOATING: &str = "missing_floating";

/// Prefix of floating placeholders (`md_<N>`)
pub const PLACEHOLDER_PREFIX: &str = "md_";

/// Reagent mixture with a fixed stock concentration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pool {
    pub id: PoolId,
    /// Stock concentration (nM)
    pub stock_concentration: f64,
    pub molecule_type: String,
    #[serde(default)]
    pub supplier: Option<String>,
}

/// Floating placeholder `md_<N>`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Placeholder(pub u32);

impl Placeholder {
    pub fn parse(text: &str) -> LabResult<Self> {
        text.strip_prefix(PLACEHOLDER_PREFIX)
            .and_then(|n| n.parse::<u32>().ok())
            .filter(|&n| n > 0)
            .map(Placeholder)
            .ok_or_else(|| LabError::InvalidRequest(format!("Invalid floating placeholder '{}'", text)))
    }
}

impl fmt::Display for Placeholder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", PLACEHOLDER_PREFIX, self.0)
    }
}

impl Serialize for Placeholder {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Placeholder {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Placeholder::parse(&text).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placeholder_grammar() {
        assert_eq!(Placeholder::parse("md_12").unwrap(), Placeholder(12));
        assert_eq!(Placeholder(3).to_string(), "md_3");
        assert!(Placeholder::parse("md_0").is_err());
        assert!(Placeholder::parse("md_x").is_err());
        assert!(Placeholder::parse(MISSING_FLOATING).is_err());
    }

    #[test]
    fn test_placeholders_sort_numerically() {
        let mut placeholders = vec![Placeholder(10), Placeholder(2), Placeholder(1)];
        placeholders.sort();
        assert_eq!(placeholders, vec![Placeholder(1), Placeholder(2), Placeholder(10)]);
    }
}
