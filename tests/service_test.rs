use sqlx::Row;

use bulk_courier::config;
use bulk_courier::model::{BulkMessageRequest, MergeVars, RecipientFilter};
use bulk_courier::service;

async fn setup_pool() -> sqlx::SqlitePool {
    let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

fn dispatch_config() -> config::Dispatch {
    config::Dispatch {
        tick_interval_ms: 5000,
        batches_per_tick: 5,
        recipients_per_tick: 50,
        default_throttle_per_minute: 50,
        default_max_retries: 3,
        max_backoff_seconds: 60,
    }
}

async fn seed_user(pool: &sqlx::SqlitePool, username: &str, role: &str) -> i64 {
    sqlx::query("INSERT INTO users (username, role) VALUES (?, ?) RETURNING id")
        .bind(username)
        .bind(role)
        .fetch_one(pool)
        .await
        .unwrap()
        .get("id")
}

/// Seed a tenant with the full lease -> unit -> property chain.
async fn seed_tenant(
    pool: &sqlx::SqlitePool,
    username: &str,
    property: &str,
    unit: &str,
    lease_status: &str,
) -> i64 {
    let user_id = seed_user(pool, username, "TENANT").await;
    let property_id: i64 = sqlx::query("INSERT INTO properties (name) VALUES (?) RETURNING id")
        .bind(property)
        .fetch_one(pool)
        .await
        .unwrap()
        .get("id");
    let unit_id: i64 =
        sqlx::query("INSERT INTO units (property_id, name) VALUES (?, ?) RETURNING id")
            .bind(property_id)
            .bind(unit)
            .fetch_one(pool)
            .await
            .unwrap()
            .get("id");
    sqlx::query("INSERT INTO leases (user_id, unit_id, status) VALUES (?, ?, ?)")
        .bind(user_id)
        .bind(unit_id)
        .bind(lease_status)
        .execute(pool)
        .await
        .unwrap();
    user_id
}

fn tenant_filter() -> RecipientFilter {
    RecipientFilter {
        roles: vec!["TENANT".into()],
        ..Default::default()
    }
}

#[tokio::test]
async fn preview_renders_sample_with_merge_fields() {
    let pool = setup_pool().await;
    let manager = seed_user(&pool, "manager", "PROPERTY_MANAGER").await;
    seed_tenant(&pool, "tenant_user", "Maple", "Unit 1", "ACTIVE").await;

    let mut merge_fields = MergeVars::new();
    merge_fields.insert("managerName".into(), "Jordan".into());
    let request = BulkMessageRequest {
        title: "Notice".into(),
        body: "Hello {{username}}, from {{managerName}}".into(),
        filters: Some(tenant_filter()),
        merge_fields,
        ..Default::default()
    };

    let preview = service::preview(&pool, &request, manager).await.unwrap();
    assert_eq!(preview.total_recipients, 1);
    assert_eq!(
        preview.sample[0].rendered_content,
        "Hello tenant_user, from Jordan"
    );

    // Side-effect free: nothing persisted.
    let batches: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM bulk_batches")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(batches, 0);
}

#[tokio::test]
async fn preview_caps_sample_at_five() {
    let pool = setup_pool().await;
    let manager = seed_user(&pool, "manager", "PROPERTY_MANAGER").await;
    for i in 0..7 {
        seed_user(&pool, &format!("tenant{}", i), "TENANT").await;
    }

    let request = BulkMessageRequest {
        title: "Notice".into(),
        body: "Hi {{username}}".into(),
        filters: Some(tenant_filter()),
        ..Default::default()
    };
    let preview = service::preview(&pool, &request, manager).await.unwrap();
    assert_eq!(preview.total_recipients, 7);
    assert_eq!(preview.sample.len(), 5);
}

#[tokio::test]
async fn empty_recipient_set_is_a_validation_error() {
    let pool = setup_pool().await;
    let manager = seed_user(&pool, "manager", "PROPERTY_MANAGER").await;

    let request = BulkMessageRequest {
        title: "Notice".into(),
        body: "Hi".into(),
        filters: Some(RecipientFilter {
            roles: vec!["CONTRACTOR".into()],
            ..Default::default()
        }),
        ..Default::default()
    };
    let err = service::preview(&pool, &request, manager).await.unwrap_err();
    assert!(err.to_string().contains("no recipients"));

    let err = service::queue(&pool, &dispatch_config(), &request, manager)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("no recipients"));
}

#[tokio::test]
async fn creator_is_excluded_from_resolution() {
    let pool = setup_pool().await;
    let manager = seed_user(&pool, "manager", "TENANT").await;
    let other = seed_user(&pool, "other", "TENANT").await;

    let request = BulkMessageRequest {
        title: "Notice".into(),
        body: "Hi {{username}}".into(),
        filters: Some(tenant_filter()),
        ..Default::default()
    };
    let preview = service::preview(&pool, &request, manager).await.unwrap();
    assert_eq!(preview.total_recipients, 1);
    assert_eq!(preview.sample[0].user_id, other);

    // A filter that only matches the requester resolves to nothing.
    let solo = BulkMessageRequest {
        recipient_ids: vec![manager],
        filters: None,
        ..request
    };
    assert!(service::preview(&pool, &solo, manager).await.is_err());
}

#[tokio::test]
async fn explicit_ids_union_with_filter_matches() {
    let pool = setup_pool().await;
    let manager = seed_user(&pool, "manager", "PROPERTY_MANAGER").await;
    let tenant = seed_user(&pool, "tenant", "TENANT").await;
    let staff = seed_user(&pool, "staff", "IN_HOUSE").await;

    let request = BulkMessageRequest {
        title: "Notice".into(),
        body: "Hi {{username}}".into(),
        filters: Some(tenant_filter()),
        recipient_ids: vec![staff, tenant],
        ..Default::default()
    };
    let preview = service::preview(&pool, &request, manager).await.unwrap();
    assert_eq!(preview.total_recipients, 2);
}

#[tokio::test]
async fn template_id_overrides_literal_body() {
    let pool = setup_pool().await;
    let manager = seed_user(&pool, "manager", "PROPERTY_MANAGER").await;
    seed_user(&pool, "tenant", "TENANT").await;

    let template_id: i64 = sqlx::query(
        "INSERT INTO message_templates (name, body) VALUES ('Welcome', 'Welcome {{username}}!') \
         RETURNING id",
    )
    .fetch_one(&pool)
    .await
    .unwrap()
    .get("id");

    let request = BulkMessageRequest {
        title: "Notice".into(),
        body: "Fallback".into(),
        template_id: Some(template_id),
        filters: Some(tenant_filter()),
        ..Default::default()
    };
    let preview = service::preview(&pool, &request, manager).await.unwrap();
    assert_eq!(preview.sample[0].rendered_content, "Welcome tenant!");

    let missing = BulkMessageRequest {
        template_id: Some(template_id + 100),
        ..request
    };
    let err = service::preview(&pool, &missing, manager).await.unwrap_err();
    assert!(err.to_string().contains("not found"));
}

#[tokio::test]
async fn queue_persists_snapshots_and_prerendered_recipients() {
    let pool = setup_pool().await;
    let manager = seed_user(&pool, "manager", "PROPERTY_MANAGER").await;
    seed_tenant(&pool, "tenant_user", "Maple", "Unit 1", "ACTIVE").await;

    let mut merge_fields = MergeVars::new();
    merge_fields.insert("managerName".into(), "Jordan".into());
    let request = BulkMessageRequest {
        title: "Rent notice".into(),
        body: "Hello {{propertyName}} {{unitName}}, {{managerName}}".into(),
        filters: Some(tenant_filter()),
        merge_fields,
        ..Default::default()
    };

    let preview = service::preview(&pool, &request, manager).await.unwrap();
    let created = service::queue(&pool, &dispatch_config(), &request, manager)
        .await
        .unwrap();

    assert_eq!(created.batch.status.as_str(), "QUEUED");
    assert_eq!(created.batch.creator_id, Some(manager));
    assert_eq!(created.batch.throttle_per_minute, 50);
    assert_eq!(created.batch.max_retries, 3);
    assert_eq!(created.batch.filters, Some(tenant_filter()));
    assert_eq!(
        created.batch.merge_fields.get("managerName").map(String::as_str),
        Some("Jordan")
    );

    // Preview/queue parity.
    let persisted: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM bulk_recipients WHERE batch_id = ?")
            .bind(created.batch.id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(persisted as usize, preview.total_recipients);
    assert_eq!(created.delivery_summary.total, persisted);
    assert_eq!(created.delivery_summary.pending, persisted);

    let rendered: Option<String> =
        sqlx::query_scalar("SELECT rendered_content FROM bulk_recipients WHERE batch_id = ?")
            .bind(created.batch.id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(rendered.as_deref(), Some("Hello Maple Unit 1, Jordan"));
}

#[tokio::test]
async fn filters_narrow_by_property_and_lease_status() {
    let pool = setup_pool().await;
    let manager = seed_user(&pool, "manager", "PROPERTY_MANAGER").await;
    let maple = seed_tenant(&pool, "maple_tenant", "Maple", "1A", "ACTIVE").await;
    seed_tenant(&pool, "oak_tenant", "Oak", "2B", "ACTIVE").await;
    seed_tenant(&pool, "gone_tenant", "Maple", "3C", "TERMINATED").await;

    let property_id: i64 = sqlx::query_scalar("SELECT id FROM properties WHERE name = 'Maple'")
        .fetch_one(&pool)
        .await
        .unwrap();

    let request = BulkMessageRequest {
        title: "Notice".into(),
        body: "Hi {{username}}".into(),
        filters: Some(RecipientFilter {
            property_ids: vec![property_id],
            lease_statuses: vec!["ACTIVE".into()],
            ..Default::default()
        }),
        ..Default::default()
    };
    let preview = service::preview(&pool, &request, manager).await.unwrap();
    assert_eq!(preview.total_recipients, 1);
    assert_eq!(preview.sample[0].user_id, maple);
}

#[tokio::test]
async fn search_matches_username_case_insensitively() {
    let pool = setup_pool().await;
    let manager = seed_user(&pool, "manager", "PROPERTY_MANAGER").await;
    let match_a = seed_user(&pool, "Anna_Smith", "TENANT").await;
    seed_user(&pool, "bob", "TENANT").await;

    let request = BulkMessageRequest {
        title: "Notice".into(),
        body: "Hi {{username}}".into(),
        filters: Some(RecipientFilter {
            search: Some("anna".into()),
            ..Default::default()
        }),
        ..Default::default()
    };
    let preview = service::preview(&pool, &request, manager).await.unwrap();
    assert_eq!(preview.total_recipients, 1);
    assert_eq!(preview.sample[0].user_id, match_a);
}

#[tokio::test]
async fn reporting_aggregates_statuses_and_surfaces_failures() {
    let pool = setup_pool().await;
    let manager = seed_user(&pool, "manager", "PROPERTY_MANAGER").await;
    let mut tenants = Vec::new();
    for i in 0..4 {
        tenants.push(seed_user(&pool, &format!("tenant{}", i), "TENANT").await);
    }

    let request = BulkMessageRequest {
        title: "Notice".into(),
        body: "Hi {{username}}".into(),
        recipient_ids: tenants.clone(),
        ..Default::default()
    };
    let batch_id = service::queue(&pool, &dispatch_config(), &request, manager)
        .await
        .unwrap()
        .batch
        .id;

    // Drive rows into a mixed final state directly against the store.
    sqlx::query("UPDATE bulk_recipients SET status = 'SENT' WHERE batch_id = ? AND user_id = ?")
        .bind(batch_id)
        .bind(tenants[0])
        .execute(&pool)
        .await
        .unwrap();
    sqlx::query(
        "UPDATE bulk_recipients SET status = 'FAILED', error_message = 'mailbox unavailable' \
         WHERE batch_id = ? AND user_id = ?",
    )
    .bind(batch_id)
    .bind(tenants[1])
    .execute(&pool)
    .await
    .unwrap();
    sqlx::query("UPDATE bulk_recipients SET status = 'SKIPPED' WHERE batch_id = ? AND user_id = ?")
        .bind(batch_id)
        .bind(tenants[2])
        .execute(&pool)
        .await
        .unwrap();

    let report = service::get_delivery_report(&pool, batch_id).await.unwrap();
    assert_eq!(report.summary.total, 4);
    assert_eq!(report.summary.sent, 1);
    assert_eq!(report.summary.failed, 2); // FAILED + SKIPPED
    assert_eq!(report.summary.pending, 1);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].user_id, tenants[1]);
    assert_eq!(
        report.failures[0].error_message.as_deref(),
        Some("mailbox unavailable")
    );

    let listing = service::list_batches(&pool).await.unwrap();
    assert_eq!(listing.len(), 1);
    assert_eq!(listing[0].delivery_summary.failed, 2);

    let statuses = service::get_recipient_statuses(&pool, batch_id).await.unwrap();
    assert_eq!(statuses.len(), 4);
    let ids: Vec<i64> = statuses.iter().map(|r| r.id).collect();
    let mut sorted = ids.clone();
    sorted.sort_unstable();
    assert_eq!(ids, sorted); // oldest first

    // Unknown batch ids are errors, not empty results.
    assert!(service::get_delivery_report(&pool, batch_id + 99).await.is_err());
    assert!(service::get_recipient_statuses(&pool, batch_id + 99)
        .await
        .is_err());
}

#[tokio::test]
async fn list_templates_newest_updated_first() {
    let pool = setup_pool().await;
    sqlx::query(
        "INSERT INTO message_templates (name, body, updated_at) \
         VALUES ('old', 'Old body', datetime('now', '-2 hours'))",
    )
    .execute(&pool)
    .await
    .unwrap();
    sqlx::query(
        "INSERT INTO message_templates (name, body, updated_at) \
         VALUES ('new', 'New body', datetime('now', '-1 hours'))",
    )
    .execute(&pool)
    .await
    .unwrap();

    let templates = service::list_templates(&pool).await.unwrap();
    assert_eq!(templates.len(), 2);
    assert_eq!(templates[0].name, "new");
    assert_eq!(templates[1].name, "old");
}
