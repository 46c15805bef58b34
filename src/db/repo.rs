use super::model::{
    BatchForDispatch, BatchRow, FailureRow, NewBatch, NewRecipient, RecipientForDispatch,
    RecipientRow, TemplateRow, UserWithLease,
};
use crate::model::{BatchStatus, MergeVars, RecipientFilter, RecipientStatus, SendStrategy};
use anyhow::{anyhow, Context, Result};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::instrument;

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized).await?;
    // Enable WAL and stricter durability.
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=FULL;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// For a file-backed SQLite URL, expand a leading `~/` and make sure the
/// parent directory exists. In-memory URLs and non-sqlite schemes pass
/// through untouched.
fn prepare_sqlite_url(url: &str) -> String {
    let Some(rest) = url.strip_prefix("sqlite:") else {
        return url.to_string();
    };
    if rest.starts_with(":memory") {
        return url.to_string();
    }
    let path = rest.trim_start_matches("//");
    let (path, query) = match path.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path, None),
    };
    if path.is_empty() {
        return url.to_string();
    }

    let expanded = match (path.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(tail), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), tail),
        _ => path.to_string(),
    };
    if let Some(parent) = std::path::Path::new(&expanded).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    match query {
        Some(q) => format!("sqlite://{}?{}", expanded, q),
        None => format!("sqlite://{}", expanded),
    }
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

fn placeholders(n: usize) -> String {
    std::iter::repeat("?").take(n).collect::<Vec<_>>().join(", ")
}

const USER_SELECT: &str = "SELECT u.id, u.username, u.full_name, u.role, \
            un.name AS unit_name, p.name AS property_name \
     FROM users u \
     LEFT JOIN leases l ON l.user_id = u.id \
     LEFT JOIN units un ON un.id = l.unit_id \
     LEFT JOIN properties p ON p.id = un.property_id";

fn user_from_row(row: &SqliteRow) -> UserWithLease {
    UserWithLease {
        id: row.get("id"),
        username: row.get("username"),
        full_name: row.get("full_name"),
        role: row.get("role"),
        unit_name: row.get("unit_name"),
        property_name: row.get("property_name"),
    }
}

/// Query the recipient store by filter. An empty filter matches every user.
#[instrument(skip_all)]
pub async fn find_users_by_filter(pool: &Pool, filter: &RecipientFilter) -> Result<Vec<UserWithLease>> {
    let search = filter
        .search
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty());

    let mut sql = String::from(USER_SELECT);
    let mut clauses: Vec<String> = Vec::new();
    if !filter.roles.is_empty() {
        clauses.push(format!("u.role IN ({})", placeholders(filter.roles.len())));
    }
    if search.is_some() {
        clauses.push("LOWER(u.username) LIKE '%' || LOWER(?) || '%'".to_string());
    }
    if !filter.property_ids.is_empty() {
        clauses.push(format!(
            "un.property_id IN ({})",
            placeholders(filter.property_ids.len())
        ));
    }
    if !filter.lease_statuses.is_empty() {
        clauses.push(format!(
            "l.status IN ({})",
            placeholders(filter.lease_statuses.len())
        ));
    }
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    sql.push_str(" ORDER BY u.id ASC");

    let mut query = sqlx::query(&sql);
    for role in &filter.roles {
        query = query.bind(role);
    }
    if let Some(search) = search {
        query = query.bind(search);
    }
    for id in &filter.property_ids {
        query = query.bind(id);
    }
    for status in &filter.lease_statuses {
        query = query.bind(status);
    }

    let rows = query.fetch_all(pool).await?;
    Ok(rows.iter().map(user_from_row).collect())
}

#[instrument(skip_all)]
pub async fn find_users_by_ids(pool: &Pool, ids: &[i64]) -> Result<Vec<UserWithLease>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let sql = format!(
        "{} WHERE u.id IN ({}) ORDER BY u.id ASC",
        USER_SELECT,
        placeholders(ids.len())
    );
    let mut query = sqlx::query(&sql);
    for id in ids {
        query = query.bind(id);
    }
    let rows = query.fetch_all(pool).await?;
    Ok(rows.iter().map(user_from_row).collect())
}

fn template_from_row(row: &SqliteRow) -> TemplateRow {
    TemplateRow {
        id: row.get("id"),
        name: row.get("name"),
        body: row.get("body"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

#[instrument(skip_all)]
pub async fn get_template(pool: &Pool, id: i64) -> Result<Option<TemplateRow>> {
    let row = sqlx::query(
        "SELECT id, name, body, created_at, updated_at FROM message_templates WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;
    Ok(row.as_ref().map(template_from_row))
}

#[instrument(skip_all)]
pub async fn list_templates(pool: &Pool) -> Result<Vec<TemplateRow>> {
    let rows = sqlx::query(
        "SELECT id, name, body, created_at, updated_at FROM message_templates \
         ORDER BY datetime(updated_at) DESC, id DESC",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows.iter().map(template_from_row).collect())
}

/// Persist a batch and its fixed recipient set in one transaction.
#[instrument(skip_all)]
pub async fn create_batch_with_recipients(
    pool: &Pool,
    batch: &NewBatch,
    recipients: &[NewRecipient],
) -> Result<i64> {
    let filters_json = batch
        .filters
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .context("failed to serialize filters snapshot")?;
    let merge_fields_json = serde_json::to_string(&batch.merge_fields)
        .context("failed to serialize merge-fields snapshot")?;

    let mut tx = pool.begin().await?;
    let batch_id: i64 = sqlx::query(
        "INSERT INTO bulk_batches \
            (title, body, status, send_strategy, scheduled_at, throttle_per_minute, \
             max_retries, filters, merge_fields, template_id, creator_id) \
         VALUES (?, ?, 'QUEUED', ?, ?, ?, ?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(&batch.title)
    .bind(&batch.body)
    .bind(batch.send_strategy.as_str())
    .bind(batch.scheduled_at)
    .bind(batch.throttle_per_minute)
    .bind(batch.max_retries)
    .bind(filters_json)
    .bind(merge_fields_json)
    .bind(batch.template_id)
    .bind(batch.creator_id)
    .fetch_one(&mut *tx)
    .await?
    .get("id");

    for recipient in recipients {
        let variables_json = serde_json::to_string(&recipient.merge_variables)
            .context("failed to serialize recipient merge variables")?;
        sqlx::query(
            "INSERT INTO bulk_recipients (batch_id, user_id, merge_variables, rendered_content) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(batch_id)
        .bind(recipient.user_id)
        .bind(variables_json)
        .bind(&recipient.rendered_content)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(batch_id)
}

fn merge_vars_from_json(raw: Option<String>) -> Result<MergeVars> {
    match raw {
        Some(raw) if !raw.is_empty() => {
            serde_json::from_str(&raw).context("invalid merge-variables JSON")
        }
        _ => Ok(MergeVars::new()),
    }
}

/// Batches the scheduler may work on this tick: non-terminal and either
/// unscheduled or past their scheduled time, oldest first.
#[instrument(skip_all)]
pub async fn due_batches(pool: &Pool, limit: i64) -> Result<Vec<BatchForDispatch>> {
    let rows = sqlx::query(
        "SELECT id, body, throttle_per_minute, max_retries, merge_fields, creator_id \
         FROM bulk_batches \
         WHERE status IN ('QUEUED', 'SENDING') \
           AND (scheduled_at IS NULL OR datetime(scheduled_at) <= CURRENT_TIMESTAMP) \
         ORDER BY datetime(created_at) ASC, id ASC LIMIT ?",
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;

    rows.into_iter()
        .map(|row| {
            Ok(BatchForDispatch {
                id: row.get("id"),
                body: row.get("body"),
                throttle_per_minute: row.get("throttle_per_minute"),
                max_retries: row.get("max_retries"),
                merge_fields: merge_vars_from_json(row.get("merge_fields"))?,
                creator_id: row.get("creator_id"),
            })
        })
        .collect()
}

/// Recipients of a batch eligible for dispatch right now: PENDING and not
/// backed off into the future, in creation (FIFO) order.
#[instrument(skip_all)]
pub async fn due_recipients(
    pool: &Pool,
    batch_id: i64,
    limit: i64,
) -> Result<Vec<RecipientForDispatch>> {
    let rows = sqlx::query(
        "SELECT id, user_id, attempts, merge_variables, rendered_content \
         FROM bulk_recipients \
         WHERE batch_id = ? AND status = 'PENDING' \
           AND (next_attempt_at IS NULL OR datetime(next_attempt_at) <= CURRENT_TIMESTAMP) \
         ORDER BY datetime(created_at) ASC, id ASC LIMIT ?",
    )
    .bind(batch_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    rows.into_iter()
        .map(|row| {
            Ok(RecipientForDispatch {
                id: row.get("id"),
                user_id: row.get("user_id"),
                attempts: row.get("attempts"),
                merge_variables: merge_vars_from_json(row.get("merge_variables"))?,
                rendered_content: row.get("rendered_content"),
            })
        })
        .collect()
}

#[instrument(skip_all)]
pub async fn count_outstanding(pool: &Pool, batch_id: i64) -> Result<i64> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM bulk_recipients \
         WHERE batch_id = ? AND status IN ('PENDING', 'SENDING')",
    )
    .bind(batch_id)
    .fetch_one(pool)
    .await?;
    Ok(count)
}

#[instrument(skip_all)]
pub async fn count_failed(pool: &Pool, batch_id: i64) -> Result<i64> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM bulk_recipients WHERE batch_id = ? AND status = 'FAILED'",
    )
    .bind(batch_id)
    .fetch_one(pool)
    .await?;
    Ok(count)
}

/// Trailing-window count of SENT transitions, read from persisted
/// `updated_at` stamps so the throttle bound survives restarts.
#[instrument(skip_all)]
pub async fn count_sent_in_window(pool: &Pool, batch_id: i64, window_secs: i64) -> Result<i64> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM bulk_recipients \
         WHERE batch_id = ? AND status = 'SENT' \
           AND datetime(updated_at) > datetime('now', ? || ' seconds')",
    )
    .bind(batch_id)
    .bind(-window_secs)
    .fetch_one(pool)
    .await?;
    Ok(count)
}

#[instrument(skip_all)]
pub async fn mark_batch_sending(pool: &Pool, batch_id: i64) -> Result<()> {
    sqlx::query(
        "UPDATE bulk_batches \
         SET status = 'SENDING', started_at = COALESCE(started_at, CURRENT_TIMESTAMP) \
         WHERE id = ? AND status IN ('QUEUED', 'SENDING')",
    )
    .bind(batch_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Finalize a batch. The status guard makes the terminal transition
/// one-time: a COMPLETED or FAILED batch is never rewritten.
#[instrument(skip_all)]
pub async fn finalize_batch(pool: &Pool, batch_id: i64, status: BatchStatus) -> Result<()> {
    sqlx::query(
        "UPDATE bulk_batches SET status = ?, completed_at = CURRENT_TIMESTAMP \
         WHERE id = ? AND status IN ('QUEUED', 'SENDING')",
    )
    .bind(status.as_str())
    .bind(batch_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Claim a recipient for one dispatch attempt. The status guard is a
/// conditional write: a concurrent dispatcher that already claimed the row
/// makes this a no-op, and the caller must skip the recipient.
#[instrument(skip_all)]
pub async fn begin_attempt(pool: &Pool, recipient_id: i64) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE bulk_recipients \
         SET status = 'SENDING', attempts = attempts + 1, \
             last_attempt_at = CURRENT_TIMESTAMP, updated_at = CURRENT_TIMESTAMP \
         WHERE id = ? AND status = 'PENDING'",
    )
    .bind(recipient_id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

#[instrument(skip_all)]
pub async fn mark_recipient_sent(
    pool: &Pool,
    recipient_id: i64,
    message_id: i64,
    rendered_content: &str,
) -> Result<()> {
    sqlx::query(
        "UPDATE bulk_recipients \
         SET status = 'SENT', message_id = ?, rendered_content = ?, \
             error_message = NULL, next_attempt_at = NULL, updated_at = CURRENT_TIMESTAMP \
         WHERE id = ? AND status = 'SENDING'",
    )
    .bind(message_id)
    .bind(rendered_content)
    .bind(recipient_id)
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn schedule_retry(
    pool: &Pool,
    recipient_id: i64,
    error_message: &str,
    backoff_secs: i64,
) -> Result<()> {
    sqlx::query(
        "UPDATE bulk_recipients \
         SET status = 'PENDING', error_message = ?, \
             next_attempt_at = datetime('now', ? || ' seconds'), updated_at = CURRENT_TIMESTAMP \
         WHERE id = ? AND status = 'SENDING'",
    )
    .bind(error_message)
    .bind(backoff_secs)
    .bind(recipient_id)
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn mark_recipient_failed(
    pool: &Pool,
    recipient_id: i64,
    error_message: &str,
) -> Result<()> {
    sqlx::query(
        "UPDATE bulk_recipients \
         SET status = 'FAILED', error_message = ?, next_attempt_at = NULL, \
             updated_at = CURRENT_TIMESTAMP \
         WHERE id = ? AND status = 'SENDING'",
    )
    .bind(error_message)
    .bind(recipient_id)
    .execute(pool)
    .await?;
    Ok(())
}

fn batch_from_row(row: &SqliteRow) -> Result<BatchRow> {
    let status: String = row.get("status");
    let status = BatchStatus::parse(&status)
        .ok_or_else(|| anyhow!("batch has unknown status {}", status))?;
    let strategy: String = row.get("send_strategy");
    let send_strategy = SendStrategy::parse(&strategy)
        .ok_or_else(|| anyhow!("batch has unknown send strategy {}", strategy))?;
    let filters = match row.get::<Option<String>, _>("filters") {
        Some(raw) if !raw.is_empty() => {
            Some(serde_json::from_str(&raw).context("invalid filters JSON")?)
        }
        _ => None,
    };
    Ok(BatchRow {
        id: row.get("id"),
        title: row.get("title"),
        body: row.get("body"),
        status,
        send_strategy,
        scheduled_at: row.get("scheduled_at"),
        throttle_per_minute: row.get("throttle_per_minute"),
        max_retries: row.get("max_retries"),
        filters,
        merge_fields: merge_vars_from_json(row.get("merge_fields"))?,
        template_id: row.get("template_id"),
        creator_id: row.get("creator_id"),
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
        created_at: row.get("created_at"),
    })
}

const BATCH_SELECT: &str = "SELECT id, title, body, status, send_strategy, scheduled_at, \
            throttle_per_minute, max_retries, filters, merge_fields, template_id, \
            creator_id, started_at, completed_at, created_at \
     FROM bulk_batches";

#[instrument(skip_all)]
pub async fn list_batches(pool: &Pool) -> Result<Vec<BatchRow>> {
    let sql = format!("{} ORDER BY datetime(created_at) DESC, id DESC", BATCH_SELECT);
    let rows = sqlx::query(&sql).fetch_all(pool).await?;
    rows.iter().map(batch_from_row).collect()
}

#[instrument(skip_all)]
pub async fn get_batch(pool: &Pool, batch_id: i64) -> Result<Option<BatchRow>> {
    let sql = format!("{} WHERE id = ?", BATCH_SELECT);
    let row = sqlx::query(&sql).bind(batch_id).fetch_optional(pool).await?;
    row.as_ref().map(batch_from_row).transpose()
}

/// Group-by-status recipient counts for one batch.
#[instrument(skip_all)]
pub async fn status_counts(pool: &Pool, batch_id: i64) -> Result<Vec<(RecipientStatus, i64)>> {
    let rows = sqlx::query(
        "SELECT status, COUNT(*) AS count FROM bulk_recipients \
         WHERE batch_id = ? GROUP BY status",
    )
    .bind(batch_id)
    .fetch_all(pool)
    .await?;

    rows.into_iter()
        .map(|row| {
            let status: String = row.get("status");
            let status = RecipientStatus::parse(&status)
                .ok_or_else(|| anyhow!("recipient has unknown status {}", status))?;
            Ok((status, row.get("count")))
        })
        .collect()
}

#[instrument(skip_all)]
pub async fn recipient_rows(pool: &Pool, batch_id: i64) -> Result<Vec<RecipientRow>> {
    let rows = sqlx::query(
        "SELECT id, batch_id, user_id, status, attempts, merge_variables, rendered_content, \
                message_id, error_message, last_attempt_at, next_attempt_at, created_at, updated_at \
         FROM bulk_recipients WHERE batch_id = ? \
         ORDER BY datetime(created_at) ASC, id ASC",
    )
    .bind(batch_id)
    .fetch_all(pool)
    .await?;

    rows.into_iter()
        .map(|row| {
            let status: String = row.get("status");
            let status = RecipientStatus::parse(&status)
                .ok_or_else(|| anyhow!("recipient has unknown status {}", status))?;
            Ok(RecipientRow {
                id: row.get("id"),
                batch_id: row.get("batch_id"),
                user_id: row.get("user_id"),
                status,
                attempts: row.get("attempts"),
                merge_variables: merge_vars_from_json(row.get("merge_variables"))?,
                rendered_content: row.get("rendered_content"),
                message_id: row.get("message_id"),
                error_message: row.get("error_message"),
                last_attempt_at: row.get("last_attempt_at"),
                next_attempt_at: row.get("next_attempt_at"),
                created_at: row.get("created_at"),
                updated_at: row.get("updated_at"),
            })
        })
        .collect()
}

/// Most recent failures first, capped by the caller.
#[instrument(skip_all)]
pub async fn recent_failures(pool: &Pool, batch_id: i64, limit: i64) -> Result<Vec<FailureRow>> {
    let rows = sqlx::query(
        "SELECT user_id, error_message FROM bulk_recipients \
         WHERE batch_id = ? AND status = 'FAILED' \
         ORDER BY datetime(updated_at) DESC, id DESC LIMIT ?",
    )
    .bind(batch_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|row| FailureRow {
            user_id: row.get("user_id"),
            error_message: row.get("error_message"),
        })
        .collect())
}
