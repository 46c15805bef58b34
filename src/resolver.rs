//! Recipient resolution and per-recipient merge context assembly.
//!
//! The resolver only produces the initial snapshot consumed at preview and
//! queue time; recipient and batch lifecycles are owned by the scheduler.

use anyhow::{bail, Result};
use std::collections::BTreeMap;

use crate::db::{self, Pool, UserWithLease};
use crate::model::{MergeVars, RecipientFilter};
use crate::render;

/// A resolved recipient with its effective merge variables and the content
/// rendered from them.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub user_id: i64,
    pub username: String,
    pub merge_variables: MergeVars,
    pub rendered_content: String,
}

/// Union filter matches with explicitly listed ids, deduplicated by user id,
/// excluding the requester. An empty union is a caller error.
pub async fn resolve_recipients(
    pool: &Pool,
    filters: Option<&RecipientFilter>,
    recipient_ids: &[i64],
    creator_id: i64,
) -> Result<Vec<UserWithLease>> {
    let filter_matches = match filters {
        Some(filter) => db::find_users_by_filter(pool, filter).await?,
        None => Vec::new(),
    };
    let direct = db::find_users_by_ids(pool, recipient_ids).await?;

    let mut combined: BTreeMap<i64, UserWithLease> = BTreeMap::new();
    for user in filter_matches.into_iter().chain(direct) {
        if user.id == creator_id {
            continue;
        }
        combined.entry(user.id).or_insert(user);
    }

    if combined.is_empty() {
        bail!("no recipients match the selected filters");
    }
    Ok(combined.into_values().collect())
}

/// Build one recipient's merge context and render the template body with it.
/// Caller-supplied merge fields win over the derived variables on collision.
pub fn build_candidate(
    user: &UserWithLease,
    template_body: &str,
    merge_fields: &MergeVars,
) -> Candidate {
    let full_name = user
        .full_name
        .clone()
        .filter(|name| !name.trim().is_empty())
        .unwrap_or_else(|| user.username.clone());

    let mut variables = MergeVars::new();
    variables.insert("username".into(), user.username.clone());
    variables.insert("fullName".into(), full_name);
    variables.insert(
        "propertyName".into(),
        user.property_name.clone().unwrap_or_default(),
    );
    variables.insert("unitName".into(), user.unit_name.clone().unwrap_or_default());
    for (key, value) in merge_fields {
        variables.insert(key.clone(), value.clone());
    }

    let rendered_content = render::render(template_body, &variables);
    Candidate {
        user_id: user.id,
        username: user.username.clone(),
        merge_variables: variables,
        rendered_content,
    }
}
