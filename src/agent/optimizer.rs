use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info};

use crate::llm::ToolCall;

/// One call of a round after ordering and de-duplication.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedCall {
    pub call: ToolCall,
    /// Content hash of `(name, arguments)`.
    pub key: String,
    /// Position in `plan` of the first call with the same key, if this one
    /// is a duplicate.
    pub duplicate_of: Option<usize>,
}

fn priority(name: &str) -> u8 {
    const PREFIXES: [&str; 5] = ["read", "get", "check", "apply", "write"];
    PREFIXES
        .iter()
        .position(|p| name.starts_with(p))
        .map_or(PREFIXES.len() as u8, |i| i as u8)
}

fn canonical(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, Value> =
                map.iter().map(|(k, v)| (k, canonical(v))).collect();
            serde_json::json!(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonical).collect()),
        other => other.clone(),
    }
}

/// Hash of the tool name and its canonical (key-sorted) arguments.
pub fn call_key(call: &ToolCall) -> String {
    let text = serde_json::json!([call.name(), canonical(&call.arguments_json())]).to_string();
    Sha256::digest(text.as_bytes())
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Orders a round's calls read → get → check → apply → write → other
/// (stable within a class) and marks repeats of an identical call.
pub fn plan_round(calls: &[ToolCall]) -> Vec<PlannedCall> {
    let mut ordered: Vec<&ToolCall> = calls.iter().collect();
    ordered.sort_by_key(|c| priority(c.name()));

    let mut first_seen: HashMap<String, usize> = HashMap::new();
    let mut plan = Vec::with_capacity(ordered.len());
    for call in ordered {
        let key = call_key(call);
        let duplicate_of = first_seen.get(&key).copied();
        if duplicate_of.is_none() {
            first_seen.insert(key.clone(), plan.len());
        } else {
            debug!(tool = call.name(), "duplicate call in round");
        }
        plan.push(PlannedCall {
            call: call.clone(),
            key,
            duplicate_of,
        });
    }
    let dups = plan.iter().filter(|p| p.duplicate_of.is_some()).count();
    if dups > 0 {
        info!(duplicates = dups, total = plan.len(), "deduplicated identical tool calls");
    }
    plan
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn orders_by_prefix_class() {
        let calls = vec![
            ToolCall::new("1", "write_config_file", "{}"),
            ToolCall::new("2", "search_entities", "{}"),
            ToolCall::new("3", "get_entities", "{}"),
            ToolCall::new("4", "read_config_file", "{}"),
        ];
        let plan = plan_round(&calls);
        let names: Vec<&str> = plan.iter().map(|p| p.call.name()).collect();
        assert_eq!(
            names,
            vec!["read_config_file", "get_entities", "write_config_file", "search_entities"]
        );
    }

    #[test]
    fn identical_calls_share_a_key_regardless_of_key_order() {
        let calls = vec![
            ToolCall::new("a", "get_entity_state", r#"{"entity_id":"light.x","attr":1}"#),
            ToolCall::new("b", "get_entity_state", r#"{"attr":1,"entity_id":"light.x"}"#),
            ToolCall::new("c", "get_entity_state", r#"{"entity_id":"light.y"}"#),
        ];
        let plan = plan_round(&calls);
        assert_eq!(plan[0].duplicate_of, None);
        assert_eq!(plan[1].duplicate_of, Some(0));
        assert_eq!(plan[2].duplicate_of, None);
        assert_eq!(plan[0].key, plan[1].key);
        assert_ne!(plan[0].key, plan[2].key);
    }
}
