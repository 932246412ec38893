//! Rack-sector association for 384-well quadrant transfers
//!
//! A 384-well plate holds four interleaved 96-well sectors. Two sectors match
//! when every quadrant holds the same reagent in both, or nothing in both; a
//! floating position matches any reagent because its pool is bound per ISO.
//! Associated groups are the equivalence classes of that match, so floatings
//! can join fixed sectors into one group.
//!
//! Within a group only sectors carrying identical reagents (same pool, same
//! placeholder) form dilution series. Such a series is ordered by descending
//! concentration: the sectors of the highest level are roots, every lower
//! sector is diluted from a sector of the next higher level by one quadrant
//! transfer.

use crate::error::{LabError, LabResult};
use crate::model::{LayoutPosition, RackLayout, RackPosition, RackShape, ReagentKey, RequestPosition, NUMBER_SECTORS};
use isoprep_common::units;
use std::collections::BTreeMap;
use tracing::debug;

/// Reagent per quadrant of one sector
type SectorReagents = Vec<Option<ReagentKey>>;

/// Per-quadrant match; floatings stand in for any reagent
fn sectors_match(a: &SectorReagents, b: &SectorReagents) -> bool {
    a.iter().zip(b).all(|pair| match pair {
        (None, None) => true,
        (Some(x), Some(y)) => {
            x == y || matches!(x, ReagentKey::Floating(_)) || matches!(y, ReagentKey::Floating(_))
        }
        _ => false,
    })
}

#[derive(Debug, Clone, PartialEq)]
pub struct SectorAssociation {
    /// Associated groups, each ordered by descending concentration then sector index
    pub groups: Vec<Vec<u8>>,
    /// Concentration of the samples in each grouped sector (nM)
    pub concentrations: BTreeMap<u8, f64>,
    /// Volume of the positions in each grouped sector (µl)
    pub volumes: BTreeMap<u8, f64>,
    /// Donor sector of every non-root sector
    pub parents: BTreeMap<u8, u8>,
}

impl SectorAssociation {
    pub fn is_root(&self, sector: u8) -> bool {
        self.concentrations.contains_key(&sector) && !self.parents.contains_key(&sector)
    }

    pub fn roots(&self) -> Vec<u8> {
        self.concentrations
            .keys()
            .copied()
            .filter(|&s| self.is_root(s))
            .collect()
    }

    pub fn children(&self, sector: u8) -> Vec<u8> {
        self.parents
            .iter()
            .filter(|(_, &parent)| parent == sector)
            .map(|(&child, _)| child)
            .collect()
    }
}

/// Unique value of a sector; several distinct values fail
fn sector_value(sector: u8, values: impl Iterator<Item = f64>, what: &str) -> LabResult<Option<f64>> {
    let mut found: Option<f64> = None;
    for value in values {
        match found {
            Some(existing) if !units::are_equal(existing, value) => {
                return Err(LabError::InconsistentSectorConcentration {
                    sector,
                    reason: format!("{} {} and {} in the same sector", what, existing, value),
                });
            }
            _ => found = Some(value),
        }
    }
    Ok(found)
}

/// Associate the sectors of a 384-well request layout
///
/// `max_dilution_factor` bounds the concentration step between a sector and
/// its donor sector.
pub fn associate(layout: &RackLayout<RequestPosition>, max_dilution_factor: f64) -> LabResult<SectorAssociation> {
    if layout.shape() != RackShape::Wells384 {
        return Err(LabError::SectorMismatch {
            sectors: Vec::new(),
            reason: format!("sector transfers need a 16x24 layout, got {}", layout.shape()),
        });
    }

    // Step 1: reagent per quadrant and sector
    let quadrants: Vec<RackPosition> = RackShape::Wells96.positions().collect();
    let reagents: Vec<SectorReagents> = (0..NUMBER_SECTORS)
        .map(|sector| {
            quadrants
                .iter()
                .map(|&q| {
                    layout
                        .get(RackPosition::from_quadrant(q, sector))
                        .and_then(|p| p.content().reagent_key())
                })
                .collect()
        })
        .collect();

    // Step 2: equivalence classes of the match over non-empty sectors
    let mut class: Vec<Option<u8>> = (0..NUMBER_SECTORS)
        .map(|sector| (!reagents[sector as usize].iter().all(Option::is_none)).then_some(sector))
        .collect();
    for a in 0..NUMBER_SECTORS as usize {
        for b in a + 1..NUMBER_SECTORS as usize {
            let (Some(class_a), Some(class_b)) = (class[a], class[b]) else { continue };
            if class_a != class_b && sectors_match(&reagents[a], &reagents[b]) {
                let (keep, merge) = (class_a.min(class_b), class_a.max(class_b));
                for c in class.iter_mut().filter(|c| **c == Some(merge)) {
                    *c = Some(keep);
                }
            }
        }
    }
    let mut classes: BTreeMap<u8, Vec<u8>> = BTreeMap::new();
    for (sector, c) in class.iter().enumerate() {
        if let Some(c) = c {
            classes.entry(*c).or_default().push(sector as u8);
        }
    }
    let mut groups: Vec<Vec<u8>> = classes.into_values().collect();
    if groups.is_empty() {
        return Err(LabError::SectorMismatch {
            sectors: Vec::new(),
            reason: "no sector holds a sample".to_string(),
        });
    }

    // Step 3: concentration and volume per grouped sector
    let mut concentrations = BTreeMap::new();
    let mut volumes = BTreeMap::new();
    let sector_map = layout.sector_map();
    for &sector in groups.iter().flatten() {
        let positions = sector_map.get(&sector).cloned().unwrap_or_default();
        let samples = positions.iter().filter(|p| p.content().is_sample());
        let concentration = sector_value(sector, samples.clone().filter_map(|p| p.concentration), "concentrations")?;
        let volume = sector_value(
            sector,
            positions
                .iter()
                .filter(|p| p.content().is_sample() || p.content().is_mock())
                .filter_map(|p| p.volume),
            "volumes",
        )?;
        match (concentration, volume) {
            (Some(c), Some(v)) => {
                concentrations.insert(sector, c);
                volumes.insert(sector, v);
            }
            _ => {
                return Err(LabError::InconsistentSectorConcentration {
                    sector,
                    reason: "no concentration or volume".to_string(),
                })
            }
        }
    }

    // Step 4: order every group, then chain the sectors of identical reagents
    let mut parents = BTreeMap::new();
    for group in groups.iter_mut() {
        group.sort_by(|a, b| {
            concentrations[b]
                .partial_cmp(&concentrations[a])
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.cmp(b))
        });
        let mut series: Vec<Vec<u8>> = Vec::new();
        for &sector in group.iter() {
            match series
                .iter_mut()
                .find(|s| reagents[s[0] as usize] == reagents[sector as usize])
            {
                Some(members) => members.push(sector),
                None => series.push(vec![sector]),
            }
        }
        for members in &series {
            chain_series(members, &concentrations, max_dilution_factor, &mut parents)?;
        }
    }

    debug!(groups = ?groups, parents = ?parents, "Associated rack sectors");
    Ok(SectorAssociation {
        groups,
        concentrations,
        volumes,
        parents,
    })
}

/// Donors for one series of sectors, already sorted by descending concentration
fn chain_series(
    series: &[u8],
    concentrations: &BTreeMap<u8, f64>,
    max_dilution_factor: f64,
    parents: &mut BTreeMap<u8, u8>,
) -> LabResult<()> {
    let mut levels: Vec<(f64, Vec<u8>)> = Vec::new();
    for &sector in series {
        let concentration = concentrations[&sector];
        match levels.last_mut() {
            Some((level, members)) if units::are_equal(*level, concentration) => members.push(sector),
            _ => levels.push((concentration, vec![sector])),
        }
    }
    for pair in levels.windows(2) {
        let (higher, donors) = &pair[0];
        let (lower, children) = &pair[1];
        if units::is_larger_than(units::dilution_factor(*higher, *lower), max_dilution_factor) {
            return Err(LabError::SectorMismatch {
                sectors: series.to_vec(),
                reason: format!(
                    "dilution from {} nM to {} nM exceeds the factor {}",
                    higher, lower, max_dilution_factor
                ),
            });
        }
        for &child in children {
            let donor = pick_donor(child, donors).ok_or_else(|| LabError::SectorMismatch {
                sectors: series.to_vec(),
                reason: format!("sector {} has no unambiguous donor sector", child),
            })?;
            parents.insert(child, donor);
        }
    }
    Ok(())
}

/// Donor preference: single candidate, same column parity, same row parity
fn pick_donor(child: u8, donors: &[u8]) -> Option<u8> {
    if donors.len() == 1 {
        return donors.first().copied();
    }
    let same_column: Vec<u8> = donors.iter().copied().filter(|d| d % 2 == child % 2).collect();
    if same_column.len() == 1 {
        return same_column.first().copied();
    }
    let same_row: Vec<u8> = donors.iter().copied().filter(|d| d / 2 == child / 2).collect();
    if same_row.len() == 1 {
        return same_row.first().copied();
    }
    None
}
