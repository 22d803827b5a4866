use serde::{Deserialize, Serialize};

use crate::api::errors::ApiError;

const MAX_USER_ID_LENGTH: usize = 128;

/// Raw query string. Values stay strings so that a malformed number is
/// reported as such instead of falling back to the default.
#[derive(Debug, Default, Deserialize)]
pub struct TopKParams {
    pub days: Option<String>,
    pub k: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryBounds {
    pub max_days: u32,
    pub default_days: u32,
    pub max_k: u32,
    pub default_k: u32,
}

impl QueryBounds {
    /// Resolves `(days, k)`, rejecting anything outside `1..=max`.
    pub fn resolve(&self, params: &TopKParams) -> Result<(u32, u32), ApiError> {
        let days = parse_bounded("days", params.days.as_deref(), self.default_days, self.max_days)?;
        let k = parse_bounded("k", params.k.as_deref(), self.default_k, self.max_k)?;
        Ok((days, k))
    }
}

fn parse_bounded(
    name: &'static str,
    raw: Option<&str>,
    default: u32,
    max: u32,
) -> Result<u32, ApiError> {
    let Some(raw) = raw else {
        return Ok(default);
    };
    let value: i64 = raw.trim().parse().map_err(|_| ApiError::InvalidParameter {
        name,
        reason: format!("{raw:?} is not an integer"),
    })?;
    match u32::try_from(value) {
        Ok(value) if (1..=max).contains(&value) => Ok(value),
        _ => Err(ApiError::InvalidParameter {
            name,
            reason: format!("must be between 1 and {max}, got {value}"),
        }),
    }
}

pub fn validate_user_id(user_id: &str) -> Result<(), ApiError> {
    let valid = !user_id.is_empty()
        && user_id.len() <= MAX_USER_ID_LENGTH
        && user_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | ':' | '@' | '-'));
    if valid {
        Ok(())
    } else {
        Err(ApiError::InvalidUserId)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankedItem {
    pub item_id: String,
    pub count: i64,
    pub rank: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopKResponse {
    pub user_id: String,
    pub days: u32,
    pub k: u32,
    pub results: Vec<RankedItem>,
    pub cached: bool,
}
