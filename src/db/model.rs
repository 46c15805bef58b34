//! Database entity and view models used by repositories.
//!
//! Keep these structs focused on the data returned by queries. Business logic
//! should live in higher layers.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::model::{BatchStatus, MergeVars, RecipientFilter, RecipientStatus, SendStrategy};

/// Recipient-store row with the lease -> unit -> property chain flattened.
#[derive(Debug, Clone)]
pub struct UserWithLease {
    pub id: i64,
    pub username: String,
    pub full_name: Option<String>,
    pub role: String,
    pub unit_name: Option<String>,
    pub property_name: Option<String>,
}

/// Template-store row.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateRow {
    pub id: i64,
    pub name: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// New batch row, as persisted by the queue operation.
#[derive(Debug, Clone)]
pub struct NewBatch {
    pub title: String,
    pub body: String,
    pub send_strategy: SendStrategy,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub throttle_per_minute: i64,
    pub max_retries: i64,
    pub filters: Option<RecipientFilter>,
    pub merge_fields: MergeVars,
    pub template_id: Option<i64>,
    pub creator_id: Option<i64>,
}

/// New recipient row with its pre-rendered content.
#[derive(Debug, Clone)]
pub struct NewRecipient {
    pub user_id: i64,
    pub merge_variables: MergeVars,
    pub rendered_content: String,
}

/// Batch slice used by the dispatch tick.
#[derive(Debug, Clone)]
pub struct BatchForDispatch {
    pub id: i64,
    pub body: String,
    pub throttle_per_minute: i64,
    pub max_retries: i64,
    pub merge_fields: MergeVars,
    pub creator_id: Option<i64>,
}

/// Recipient slice used by the dispatch tick.
#[derive(Debug, Clone)]
pub struct RecipientForDispatch {
    pub id: i64,
    pub user_id: i64,
    pub attempts: i64,
    pub merge_variables: MergeVars,
    pub rendered_content: Option<String>,
}

/// Full batch row for reporting.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchRow {
    pub id: i64,
    pub title: String,
    pub body: String,
    pub status: BatchStatus,
    pub send_strategy: SendStrategy,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub throttle_per_minute: i64,
    pub max_retries: i64,
    pub filters: Option<RecipientFilter>,
    pub merge_fields: MergeVars,
    pub template_id: Option<i64>,
    pub creator_id: Option<i64>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Full recipient row for reporting.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecipientRow {
    pub id: i64,
    pub batch_id: i64,
    pub user_id: i64,
    pub status: RecipientStatus,
    pub attempts: i64,
    pub merge_variables: MergeVars,
    pub rendered_content: Option<String>,
    pub message_id: Option<i64>,
    pub error_message: Option<String>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One failed delivery surfaced by the delivery report.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureRow {
    pub user_id: i64,
    pub error_message: Option<String>,
}
