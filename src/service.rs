//! The engine's API surface: preview, queue, and reporting.
//!
//! Everything here is request/response over the store; the dispatch state
//! machine lives in [`crate::scheduler`].

use anyhow::{anyhow, Result};
use serde::Serialize;
use tracing::{info, instrument};

use crate::config;
use crate::db::{
    self, BatchRow, FailureRow, NewBatch, NewRecipient, Pool, RecipientRow, TemplateRow,
};
use crate::model::{
    BulkMessagePreview, BulkMessageRequest, DeliverySummary, PreviewEntry, RecipientStatus,
    SendStrategy,
};
use crate::resolver;

/// How many rendered candidates a preview returns.
pub const PREVIEW_SAMPLE_SIZE: usize = 5;
/// How many recent failures a delivery report surfaces.
pub const FAILURE_REPORT_LIMIT: i64 = 10;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchWithSummary {
    #[serde(flatten)]
    pub batch: BatchRow,
    pub delivery_summary: DeliverySummary,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryReport {
    pub summary: DeliverySummary,
    pub failures: Vec<FailureRow>,
}

async fn resolve_template_body(pool: &Pool, request: &BulkMessageRequest) -> Result<String> {
    match request.template_id {
        Some(template_id) => db::get_template(pool, template_id)
            .await?
            .map(|template| template.body)
            .ok_or_else(|| anyhow!("template {} not found", template_id)),
        None => Ok(request.body.clone()),
    }
}

/// Render the first few candidates without persisting anything.
#[instrument(skip_all)]
pub async fn preview(
    pool: &Pool,
    request: &BulkMessageRequest,
    creator_id: i64,
) -> Result<BulkMessagePreview> {
    let recipients = resolver::resolve_recipients(
        pool,
        request.filters.as_ref(),
        &request.recipient_ids,
        creator_id,
    )
    .await?;
    let template_body = resolve_template_body(pool, request).await?;

    let sample = recipients
        .iter()
        .take(PREVIEW_SAMPLE_SIZE)
        .map(|user| {
            let candidate = resolver::build_candidate(user, &template_body, &request.merge_fields);
            PreviewEntry {
                user_id: candidate.user_id,
                username: candidate.username,
                merge_variables: candidate.merge_variables,
                rendered_content: candidate.rendered_content,
            }
        })
        .collect();

    Ok(BulkMessagePreview {
        total_recipients: recipients.len(),
        sample,
    })
}

/// Resolve, render, and persist a batch with its fixed recipient set. The
/// stored snapshots (template body, filters, merge fields, per-recipient
/// rendered content) let later ticks send without the original request.
#[instrument(skip_all)]
pub async fn queue(
    pool: &Pool,
    dispatch: &config::Dispatch,
    request: &BulkMessageRequest,
    creator_id: i64,
) -> Result<BatchWithSummary> {
    let recipients = resolver::resolve_recipients(
        pool,
        request.filters.as_ref(),
        &request.recipient_ids,
        creator_id,
    )
    .await?;
    let template_body = resolve_template_body(pool, request).await?;

    let scheduled_at = match request.send_strategy {
        SendStrategy::Scheduled => request.scheduled_at,
        SendStrategy::Immediate => None,
    };

    let new_batch = NewBatch {
        title: request.title.clone(),
        body: template_body.clone(),
        send_strategy: request.send_strategy,
        scheduled_at,
        throttle_per_minute: request
            .throttle_per_minute
            .unwrap_or(dispatch.default_throttle_per_minute),
        max_retries: request.max_retries.unwrap_or(dispatch.default_max_retries),
        filters: request.filters.clone(),
        merge_fields: request.merge_fields.clone(),
        template_id: request.template_id,
        creator_id: Some(creator_id),
    };

    let new_recipients: Vec<NewRecipient> = recipients
        .iter()
        .map(|user| {
            let candidate = resolver::build_candidate(user, &template_body, &request.merge_fields);
            NewRecipient {
                user_id: candidate.user_id,
                merge_variables: candidate.merge_variables,
                rendered_content: candidate.rendered_content,
            }
        })
        .collect();

    let batch_id = db::create_batch_with_recipients(pool, &new_batch, &new_recipients).await?;
    info!(
        batch_id,
        recipients = new_recipients.len(),
        "queued bulk message batch"
    );
    get_batch(pool, batch_id).await
}

fn build_summary(counts: &[(RecipientStatus, i64)]) -> DeliverySummary {
    let mut summary = DeliverySummary::default();
    for (status, count) in counts {
        summary.total += count;
        match status {
            RecipientStatus::Sent => summary.sent += count,
            RecipientStatus::Failed | RecipientStatus::Skipped => summary.failed += count,
            RecipientStatus::Pending | RecipientStatus::Sending => summary.pending += count,
        }
    }
    summary
}

#[instrument(skip_all)]
pub async fn list_batches(pool: &Pool) -> Result<Vec<BatchWithSummary>> {
    let batches = db::list_batches(pool).await?;
    let mut out = Vec::with_capacity(batches.len());
    for batch in batches {
        let counts = db::status_counts(pool, batch.id).await?;
        out.push(BatchWithSummary {
            delivery_summary: build_summary(&counts),
            batch,
        });
    }
    Ok(out)
}

#[instrument(skip_all)]
pub async fn get_batch(pool: &Pool, batch_id: i64) -> Result<BatchWithSummary> {
    let batch = db::get_batch(pool, batch_id)
        .await?
        .ok_or_else(|| anyhow!("bulk message batch {} not found", batch_id))?;
    let counts = db::status_counts(pool, batch_id).await?;
    Ok(BatchWithSummary {
        delivery_summary: build_summary(&counts),
        batch,
    })
}

async fn ensure_batch_exists(pool: &Pool, batch_id: i64) -> Result<()> {
    db::get_batch(pool, batch_id)
        .await?
        .map(|_| ())
        .ok_or_else(|| anyhow!("bulk message batch {} not found", batch_id))
}

/// Full per-recipient listing, oldest first.
#[instrument(skip_all)]
pub async fn get_recipient_statuses(pool: &Pool, batch_id: i64) -> Result<Vec<RecipientRow>> {
    ensure_batch_exists(pool, batch_id).await?;
    db::recipient_rows(pool, batch_id).await
}

/// Status rollup plus the most recent failures.
#[instrument(skip_all)]
pub async fn get_delivery_report(pool: &Pool, batch_id: i64) -> Result<DeliveryReport> {
    ensure_batch_exists(pool, batch_id).await?;
    let counts = db::status_counts(pool, batch_id).await?;
    let failures = db::recent_failures(pool, batch_id, FAILURE_REPORT_LIMIT).await?;
    Ok(DeliveryReport {
        summary: build_summary(&counts),
        failures,
    })
}

#[instrument(skip_all)]
pub async fn list_templates(pool: &Pool) -> Result<Vec<TemplateRow>> {
    db::list_templates(pool).await
}
