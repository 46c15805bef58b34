//! The periodic dispatch tick.
//!
//! One tick selects due batches, gates each by its trailing-window throttle,
//! and walks eligible recipients sequentially through
//! `PENDING -> SENDING -> {SENT | PENDING(retry) | FAILED}`. A tick may leave
//! work unfinished on purpose; throttling spreads a batch across many ticks.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument, warn};

use crate::config;
use crate::db::{self, BatchForDispatch, Pool, RecipientForDispatch};
use crate::model::BatchStatus;
use crate::render;
use crate::transport::MessageTransport;

/// Trailing window over which SENT transitions count against the per-minute
/// throttle.
pub const THROTTLE_WINDOW_SECS: i64 = 60;

#[derive(Debug, Clone, Copy, Default)]
pub struct TickOutcome {
    pub batches: usize,
    pub sent: usize,
    pub retried: usize,
    pub failed: usize,
    pub finalized: usize,
}

impl TickOutcome {
    pub fn did_work(&self) -> bool {
        self.sent + self.retried + self.failed + self.finalized > 0
    }
}

/// Run one dispatch pass. Store errors propagate; per-recipient transport
/// errors are isolated and drive the retry policy instead.
#[instrument(skip_all)]
pub async fn tick(
    pool: &Pool,
    transport: &dyn MessageTransport,
    cfg: &config::Dispatch,
) -> Result<TickOutcome> {
    let mut outcome = TickOutcome::default();
    let batches = db::due_batches(pool, cfg.batches_per_tick).await?;
    for batch in batches {
        outcome.batches += 1;
        dispatch_batch(pool, transport, cfg, &batch, &mut outcome).await?;
    }
    Ok(outcome)
}

async fn dispatch_batch(
    pool: &Pool,
    transport: &dyn MessageTransport,
    cfg: &config::Dispatch,
    batch: &BatchForDispatch,
    outcome: &mut TickOutcome,
) -> Result<()> {
    let due = db::due_recipients(pool, batch.id, cfg.recipients_per_tick).await?;
    if due.is_empty() {
        // Either every recipient is terminal (finalize) or the stragglers are
        // backed off into the future (leave the batch for a later tick).
        if finalize_if_done(pool, batch.id).await? {
            outcome.finalized += 1;
        }
        return Ok(());
    }

    let sent_recently = db::count_sent_in_window(pool, batch.id, THROTTLE_WINDOW_SECS).await?;
    let capacity = (batch.throttle_per_minute - sent_recently).max(0);
    if capacity == 0 {
        return Ok(());
    }

    db::mark_batch_sending(pool, batch.id).await?;

    let Some(sender_id) = batch.creator_id else {
        error!(batch_id = batch.id, "batch has no creator; failing it");
        db::finalize_batch(pool, batch.id, BatchStatus::Failed).await?;
        outcome.finalized += 1;
        return Ok(());
    };

    for recipient in due.into_iter().take(capacity as usize) {
        send_one(pool, transport, cfg, batch, sender_id, recipient, outcome).await?;
    }
    Ok(())
}

async fn send_one(
    pool: &Pool,
    transport: &dyn MessageTransport,
    cfg: &config::Dispatch,
    batch: &BatchForDispatch,
    sender_id: i64,
    recipient: RecipientForDispatch,
    outcome: &mut TickOutcome,
) -> Result<()> {
    // Conditional claim; a row already taken by another dispatcher is skipped.
    if !db::begin_attempt(pool, recipient.id).await? {
        return Ok(());
    }
    let attempts = recipient.attempts + 1;

    let content = match recipient.rendered_content {
        Some(content) => content,
        None => {
            let variables =
                render::merged_variables(&batch.merge_fields, &recipient.merge_variables);
            render::render(&batch.body, &variables)
        }
    };

    match transport
        .send_message(&content, recipient.user_id, sender_id)
        .await
    {
        Ok(message_id) => {
            db::mark_recipient_sent(pool, recipient.id, message_id, &content).await?;
            info!(
                batch_id = batch.id,
                recipient_id = recipient.id,
                message_id,
                "recipient delivered"
            );
            outcome.sent += 1;
            if finalize_if_done(pool, batch.id).await? {
                outcome.finalized += 1;
            }
        }
        Err(err) => {
            let retried = handle_send_failure(
                pool,
                recipient.id,
                attempts,
                batch.max_retries,
                cfg.max_backoff_seconds,
                &err,
            )
            .await?;
            warn!(
                ?err,
                batch_id = batch.id,
                recipient_id = recipient.id,
                attempts,
                retried,
                "send failed"
            );
            if retried {
                outcome.retried += 1;
            } else {
                outcome.failed += 1;
                if finalize_if_done(pool, batch.id).await? {
                    outcome.finalized += 1;
                }
            }
        }
    }
    Ok(())
}

/// Retry policy: exponential backoff below the retry ceiling, terminal
/// failure at it. Returns whether the recipient was requeued.
async fn handle_send_failure(
    pool: &Pool,
    recipient_id: i64,
    attempts: i64,
    max_retries: i64,
    max_backoff_secs: i64,
    err: &anyhow::Error,
) -> Result<bool> {
    let should_retry = attempts < max_retries;
    let message = format!("{err:#}");
    if should_retry {
        let backoff = backoff_seconds(attempts, max_backoff_secs);
        db::schedule_retry(pool, recipient_id, &message, backoff).await?;
    } else {
        db::mark_recipient_failed(pool, recipient_id, &message).await?;
    }
    Ok(should_retry)
}

fn backoff_seconds(attempts: i64, cap: i64) -> i64 {
    let exp = (1_i64) << attempts.clamp(0, 32);
    exp.min(cap)
}

/// Completion check: once no PENDING or SENDING recipients remain, the batch
/// becomes FAILED if any recipient failed, COMPLETED otherwise. The
/// status-guarded update in the repo makes this transition one-time.
async fn finalize_if_done(pool: &Pool, batch_id: i64) -> Result<bool> {
    if db::count_outstanding(pool, batch_id).await? > 0 {
        return Ok(false);
    }
    let status = if db::count_failed(pool, batch_id).await? > 0 {
        BatchStatus::Failed
    } else {
        BatchStatus::Completed
    };
    db::finalize_batch(pool, batch_id, status).await?;
    info!(batch_id, status = status.as_str(), "batch finalized");
    Ok(true)
}

/// Sequential worker loop: the next tick only starts after the previous one
/// has fully finished, so ticks never overlap within a process.
pub async fn run(pool: Pool, transport: Arc<dyn MessageTransport>, cfg: config::Dispatch) {
    let interval = Duration::from_millis(cfg.tick_interval_ms);
    loop {
        match tick(&pool, transport.as_ref(), &cfg).await {
            Ok(outcome) if outcome.did_work() => {
                info!(
                    batches = outcome.batches,
                    sent = outcome.sent,
                    retried = outcome.retried,
                    failed = outcome.failed,
                    finalized = outcome.finalized,
                    "dispatch tick finished"
                );
            }
            Ok(_) => {}
            Err(err) => error!(?err, "dispatch tick failed"),
        }
        tokio::time::sleep(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_then_caps() {
        assert_eq!(backoff_seconds(1, 60), 2);
        assert_eq!(backoff_seconds(2, 60), 4);
        assert_eq!(backoff_seconds(3, 60), 8);
        assert_eq!(backoff_seconds(5, 60), 32);
        assert_eq!(backoff_seconds(6, 60), 60);
        assert_eq!(backoff_seconds(40, 60), 60);
    }
}
