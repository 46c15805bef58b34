//! Merge-field rendering.
//!
//! Substitutes `{{key}}` placeholders (case-insensitive, optional inner
//! whitespace) from a variable map. Placeholders with no matching variable
//! are left verbatim; callers see the unresolved tag rather than an error.

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

use crate::model::MergeVars;

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{\s*(\w+)\s*\}\}").expect("placeholder regex"));

/// Render a template body against a variable map. Pure: identical inputs
/// always produce identical output.
pub fn render(template: &str, variables: &MergeVars) -> String {
    let lowered: std::collections::BTreeMap<String, &str> = variables
        .iter()
        .map(|(key, value)| (key.to_ascii_lowercase(), value.as_str()))
        .collect();

    PLACEHOLDER
        .replace_all(template, |caps: &Captures<'_>| {
            match lowered.get(&caps[1].to_ascii_lowercase()) {
                Some(value) => (*value).to_string(),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// Batch-level merge fields overlaid with per-recipient variables; the
/// recipient's own values win on key collision.
pub fn merged_variables(batch_fields: &MergeVars, recipient_vars: &MergeVars) -> MergeVars {
    let mut merged = batch_fields.clone();
    for (key, value) in recipient_vars {
        merged.insert(key.clone(), value.clone());
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> MergeVars {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn replaces_case_insensitively() {
        let out = render(
            "Hello {{Username}}, welcome to {{PROPERTYNAME}}",
            &vars(&[("username", "alice"), ("propertyName", "Maple")]),
        );
        assert_eq!(out, "Hello alice, welcome to Maple");
    }

    #[test]
    fn tolerates_inner_whitespace() {
        let out = render("Hi {{ username }}!", &vars(&[("username", "bob")]));
        assert_eq!(out, "Hi bob!");
    }

    #[test]
    fn unknown_placeholders_stay_verbatim() {
        let out = render("Hi {{username}}, ref {{ticketId}}", &vars(&[("username", "eve")]));
        assert_eq!(out, "Hi eve, ref {{ticketId}}");
    }

    #[test]
    fn rendering_is_deterministic() {
        let variables = vars(&[("a", "1"), ("b", "2")]);
        let first = render("{{a}}-{{b}}-{{a}}", &variables);
        let second = render("{{a}}-{{b}}-{{a}}", &variables);
        assert_eq!(first, second);
        assert_eq!(first, "1-2-1");
    }

    #[test]
    fn recipient_variables_override_batch_fields() {
        let merged = merged_variables(
            &vars(&[("managerName", "Jordan"), ("username", "placeholder")]),
            &vars(&[("username", "tenant_user")]),
        );
        assert_eq!(merged.get("username").map(String::as_str), Some("tenant_user"));
        assert_eq!(merged.get("managerName").map(String::as_str), Some("Jordan"));
    }
}
