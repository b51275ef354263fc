//! Render-related data models.
//!
//! - `RenderRecord`: the unit the reconciliation engine manages (timestamps normalized)
//! - `RenderDocument`: ingress shape with heterogeneous timestamps
//! - `RenderScope`: active URL context every record is filtered against

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::identity::{ensure_scheme, fingerprint, normalize_json_timestamp, normalize_url};

/// Prefix marking an id as client-generated and not yet persisted.
pub const OPTIMISTIC_ID_PREFIX: &str = "optimistic-";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum RenderStatus {
    Queued,
    Ready,
    Failed,
}

impl RenderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RenderStatus::Queued => "queued",
            RenderStatus::Ready => "ready",
            RenderStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RenderStatus::Ready | RenderStatus::Failed)
    }
}

impl Default for RenderStatus {
    fn default() -> Self {
        RenderStatus::Queued
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RenderRecord {
    pub id: String,
    pub key: Option<String>,
    pub status: RenderStatus,
    pub url: Option<String>,
    pub url_fingerprint: Option<String>,
    pub name_hint: Option<String>,
    pub html: Option<String>,
    #[serde(default)]
    pub archived: bool,
    /// Epoch milliseconds, 0 when unknown.
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub updated_at: i64,
}

impl RenderRecord {
    pub fn is_optimistic(&self) -> bool {
        self.id.starts_with(OPTIMISTIC_ID_PREFIX)
    }

    /// Key with `None` folded into the empty string.
    pub fn key_str(&self) -> &str {
        self.key.as_deref().unwrap_or_default()
    }

    pub fn is_queued(&self) -> bool {
        self.status == RenderStatus::Queued
    }
}

/// A render as delivered by a feed or snapshot, before timestamp normalization.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RenderDocument {
    pub id: String,
    pub key: Option<String>,
    pub status: RenderStatus,
    pub url: Option<String>,
    pub url_fingerprint: Option<String>,
    pub name_hint: Option<String>,
    pub html: Option<String>,
    pub archived: Option<bool>,
    pub created_at: Value,
    pub updated_at: Value,
}

impl From<RenderDocument> for RenderRecord {
    fn from(doc: RenderDocument) -> Self {
        Self {
            created_at: normalize_json_timestamp(&doc.created_at),
            updated_at: normalize_json_timestamp(&doc.updated_at),
            id: doc.id,
            key: doc.key,
            status: doc.status,
            url: doc.url,
            url_fingerprint: doc.url_fingerprint,
            name_hint: doc.name_hint,
            html: doc.html,
            archived: doc.archived.unwrap_or(false),
        }
    }
}

/// The owner + canonical URL every engine instance is bound to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderScope {
    pub owner: String,
    pub url: String,
    pub url_fingerprint: String,
}

impl RenderScope {
    pub fn for_url(owner: impl Into<String>, raw_url: &str) -> Self {
        let url = normalize_url(&ensure_scheme(raw_url));
        Self {
            owner: owner.into(),
            url_fingerprint: fingerprint(&url),
            url,
        }
    }

    /// Exact URL, then URL fingerprint, then a key stored under the fingerprint directory.
    pub fn matches(&self, record: &RenderRecord) -> bool {
        if let Some(url) = record.url.as_deref() {
            if normalize_url(url) == self.url {
                return true;
            }
        }

        if record.url_fingerprint.as_deref() == Some(self.url_fingerprint.as_str()) {
            return true;
        }

        record
            .key_str()
            .split('/')
            .any(|segment| segment == self.url_fingerprint)
    }
}

/// Body sent to the job submission endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RenderJobRequest {
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url_fingerprint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name_hint: Option<String>,
}

/// Non-error answers from the job submission endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitResponse {
    /// Finished synchronously with the artifact.
    Completed { html: String },
    /// Accepted for later completion (HTTP 202).
    Accepted,
}
