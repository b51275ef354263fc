use std::convert::TryFrom;

use anyhow::{anyhow, Result};

use crate::db::models::RenderStatus;

pub fn limit_to_i64(value: usize) -> Result<i64> {
    i64::try_from(value).map_err(|_| anyhow!("limit {value} exceeds SQLite INTEGER range"))
}

pub fn parse_status(value: &str) -> Result<RenderStatus> {
    match value {
        "queued" => Ok(RenderStatus::Queued),
        "ready" => Ok(RenderStatus::Ready),
        "failed" => Ok(RenderStatus::Failed),
        other => Err(anyhow!("unknown render status {other}")),
    }
}
