//! `$N.field` variable-reference resolution.
//!
//! LLM tool batches may reference results of earlier calls in the same
//! batch: `"trackId": "$0.trackId"` resolves to the `trackId` field of
//! the 0th prior tool result. Unresolvable refs are left untouched so
//! validation can report them with context.

use serde_json::Value;
use tracing::warn;

/// Resolve every `$N.field` string in `params` against `prior_results`.
pub fn resolve_variable_refs(params: &Value, prior_results: &[Value]) -> Value {
    match params {
        Value::String(s) => resolve_ref(s, prior_results)
            .unwrap_or_else(|| Value::String(s.clone())),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve_variable_refs(v, prior_results)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|v| resolve_variable_refs(v, prior_results))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn resolve_ref(s: &str, prior_results: &[Value]) -> Option<Value> {
    let rest = s.strip_prefix('$')?;
    let (index, field) = rest.split_once('.')?;
    let index: usize = index.parse().ok()?;
    let Some(result) = prior_results.get(index) else {
        warn!(reference = %s, available = prior_results.len(), "variable ref out of range");
        return None;
    };
    let resolved = result.get(field);
    if resolved.is_none() {
        warn!(reference = %s, "variable ref field missing from prior result");
    }
    resolved.cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_resolves_field_from_prior_result() {
        let prior = vec![json!({"trackId": "t-1"})];
        let params = json!({"trackId": "$0.trackId", "name": "Groove"});
        let resolved = resolve_variable_refs(&params, &prior);
        assert_eq!(resolved["trackId"], "t-1");
        assert_eq!(resolved["name"], "Groove");
    }

    #[test]
    fn test_resolves_inside_nested_arrays() {
        let prior = vec![json!({"regionId": "r-9"})];
        let params = json!({"targets": [{"regionId": "$0.regionId"}]});
        let resolved = resolve_variable_refs(&params, &prior);
        assert_eq!(resolved["targets"][0]["regionId"], "r-9");
    }

    #[test]
    fn test_out_of_range_ref_left_untouched() {
        let params = json!({"trackId": "$3.trackId"});
        let resolved = resolve_variable_refs(&params, &[]);
        assert_eq!(resolved["trackId"], "$3.trackId");
    }

    #[test]
    fn test_plain_dollar_strings_are_not_refs() {
        let params = json!({"name": "$pecial", "price": "$0"});
        let resolved = resolve_variable_refs(&params, &[json!({"trackId": "t"})]);
        assert_eq!(resolved["name"], "$pecial");
        assert_eq!(resolved["price"], "$0");
    }
}
