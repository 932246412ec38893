//! Rules for the position type and pool attributes

use super::predicates::{PLACEHOLDER, POOL_ID, POSITION_TYPE};
use super::{Defect, PositionReader};
use crate::context::Context;
use crate::model::{Placeholder, PoolId, PositionType, WellContent, MISSING_FLOATING};

/// How floating positions may carry a pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FloatingPools {
    /// Request layouts: placeholder only
    Forbidden,
    /// Plate layouts: a bound pool id or the missing-floating marker
    Bound,
}

pub(crate) fn read_content(
    reader: &mut PositionReader<'_>,
    context: &Context,
    floating_pools: FloatingPools,
) -> Option<WellContent> {
    let value = reader.require(POSITION_TYPE)?;
    let position_type: PositionType = match value.parse() {
        Ok(position_type) => position_type,
        Err(_) => {
            let position = reader.label();
            reader.defect(Defect::InvalidPositionType {
                position,
                value: value.to_string(),
            });
            return None;
        }
    };
    let name = position_type.name();

    match position_type {
        PositionType::Fixed => {
            reader.forbid(PLACEHOLDER, name);
            let pool = read_known_pool(reader, context)?;
            Some(WellContent::Fixed { pool })
        }
        PositionType::Floating => {
            let placeholder = read_placeholder(reader);
            let pool = match floating_pools {
                FloatingPools::Forbidden => {
                    reader.forbid(POOL_ID, name);
                    None
                }
                FloatingPools::Bound => read_floating_pool(reader, context),
            };
            Some(WellContent::Floating {
                placeholder: placeholder?,
                pool,
            })
        }
        PositionType::Library => {
            reader.forbid(PLACEHOLDER, name);
            let pool = reader.parse::<PoolId>(POOL_ID);
            Some(WellContent::Library { pool })
        }
        PositionType::Mock | PositionType::Untreated | PositionType::Empty => {
            reader.forbid(POOL_ID, name);
            reader.forbid(PLACEHOLDER, name);
            Some(match position_type {
                PositionType::Mock => WellContent::Mock,
                PositionType::Untreated => WellContent::Untreated,
                _ => WellContent::Empty,
            })
        }
    }
}

fn read_known_pool(reader: &mut PositionReader<'_>, context: &Context) -> Option<PoolId> {
    let value = reader.require(POOL_ID)?;
    match value.parse::<PoolId>() {
        Ok(id) if context.has_pool(id) => Some(id),
        _ => {
            let position = reader.label();
            reader.defect(Defect::UnknownPool {
                position,
                value: value.to_string(),
            });
            None
        }
    }
}

fn read_placeholder(reader: &mut PositionReader<'_>) -> Option<Placeholder> {
    let value = reader.require(PLACEHOLDER)?;
    match Placeholder::parse(value) {
        Ok(placeholder) => Some(placeholder),
        Err(_) => {
            reader.invalid(PLACEHOLDER, value);
            None
        }
    }
}

fn read_floating_pool(reader: &mut PositionReader<'_>, context: &Context) -> Option<PoolId> {
    let value = reader.take(POOL_ID)?;
    if value == MISSING_FLOATING {
        return None;
    }
    let position = reader.label();
    match value.parse::<PoolId>() {
        Ok(id) if context.has_pool(id) => Some(id),
        Ok(_) => {
            reader.defect(Defect::UnknownPool {
                position,
                value: value.to_string(),
            });
            None
        }
        Err(_) => {
            reader.defect(Defect::InvalidFloatingPool {
                position,
                value: value.to_string(),
            });
            None
        }
    }
}

/// `(predicate, value)` pairs describing a well content
pub(crate) fn content_tag_values(content: &WellContent) -> Vec<(&'static str, String)> {
    let mut values = vec![(POSITION_TYPE, content.position_type().name().to_string())];
    match content {
        WellContent::Fixed { pool } => values.push((POOL_ID, pool.to_string())),
        WellContent::Floating { placeholder, pool } => {
            values.push((PLACEHOLDER, placeholder.to_string()));
            if let Some(pool) = pool {
                values.push((POOL_ID, pool.to_string()));
            }
        }
        WellContent::Library { pool: Some(pool) } => values.push((POOL_ID, pool.to_string())),
        _ => {}
    }
    values
}
