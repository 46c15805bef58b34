use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Merge variables for a batch or a single recipient. A `BTreeMap` keeps the
/// persisted JSON snapshots stable across runs.
pub type MergeVars = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchStatus {
    Queued,
    Sending,
    Completed,
    Failed,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Queued => "QUEUED",
            BatchStatus::Sending => "SENDING",
            BatchStatus::Completed => "COMPLETED",
            BatchStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "QUEUED" => Some(BatchStatus::Queued),
            "SENDING" => Some(BatchStatus::Sending),
            "COMPLETED" => Some(BatchStatus::Completed),
            "FAILED" => Some(BatchStatus::Failed),
            _ => None,
        }
    }

    /// Terminal batches are never revisited by the scheduler.
    pub fn is_terminal(&self) -> bool {
        matches!(self, BatchStatus::Completed | BatchStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecipientStatus {
    Pending,
    Sending,
    Sent,
    Failed,
    Skipped,
}

impl RecipientStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecipientStatus::Pending => "PENDING",
            RecipientStatus::Sending => "SENDING",
            RecipientStatus::Sent => "SENT",
            RecipientStatus::Failed => "FAILED",
            RecipientStatus::Skipped => "SKIPPED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(RecipientStatus::Pending),
            "SENDING" => Some(RecipientStatus::Sending),
            "SENT" => Some(RecipientStatus::Sent),
            "FAILED" => Some(RecipientStatus::Failed),
            "SKIPPED" => Some(RecipientStatus::Skipped),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RecipientStatus::Sent | RecipientStatus::Failed | RecipientStatus::Skipped
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SendStrategy {
    #[default]
    Immediate,
    Scheduled,
}

impl SendStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SendStrategy::Immediate => "IMMEDIATE",
            SendStrategy::Scheduled => "SCHEDULED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "IMMEDIATE" => Some(SendStrategy::Immediate),
            "SCHEDULED" => Some(SendStrategy::Scheduled),
            _ => None,
        }
    }
}

/// Recipient selection filter. Role and lease-status values are attributes of
/// the consumed recipient store and are passed through opaquely.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RecipientFilter {
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub property_ids: Vec<i64>,
    #[serde(default)]
    pub lease_statuses: Vec<String>,
    #[serde(default)]
    pub search: Option<String>,
}

impl RecipientFilter {
    pub fn is_empty(&self) -> bool {
        self.roles.is_empty()
            && self.property_ids.is_empty()
            && self.lease_statuses.is_empty()
            && self.search.is_none()
    }
}

/// One bulk-send request as submitted by the caller.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkMessageRequest {
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub template_id: Option<i64>,
    #[serde(default)]
    pub filters: Option<RecipientFilter>,
    #[serde(default)]
    pub recipient_ids: Vec<i64>,
    #[serde(default)]
    pub send_strategy: SendStrategy,
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub throttle_per_minute: Option<i64>,
    #[serde(default)]
    pub max_retries: Option<i64>,
    #[serde(default)]
    pub merge_fields: MergeVars,
}

/// Per-batch recipient status rollup. `failed` folds in SKIPPED and `pending`
/// folds in SENDING so the four numbers always sum to `total`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeliverySummary {
    pub total: i64,
    pub sent: i64,
    pub failed: i64,
    pub pending: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewEntry {
    pub user_id: i64,
    pub username: String,
    pub merge_variables: MergeVars,
    pub rendered_content: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkMessagePreview {
    pub total_recipients: usize,
    pub sample: Vec<PreviewEntry>,
}
