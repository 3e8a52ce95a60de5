//! Conversion of filter lists into content-blocker rules

use crate::error::ShieldsError;
use adblock::lists::{FilterSet, ParseOptions};
use serde_json::{json, Value};
use shields_types::BlockingMode;

/// Convert filter list text into content-blocker rules
pub fn rules_from_filter_text(target: &str, text: &str) -> Result<Vec<Value>, ShieldsError> {
    let mut filter_set = FilterSet::new(true);
    filter_set.add_filter_list(text, ParseOptions::default());

    let (rules, _unsupported) = filter_set
        .into_content_blocking()
        .map_err(|_| ShieldsError::compile(target, "filters could not be converted"))?;

    match serde_json::to_value(&rules)? {
        Value::Array(rules) => Ok(rules),
        _ => Err(ShieldsError::compile(target, "converted rules are not a list")),
    }
}

/// Parse a rule document that is already in content-blocker form
pub fn rules_from_json(target: &str, text: &str) -> Result<Vec<Value>, ShieldsError> {
    serde_json::from_str(text).map_err(|e| ShieldsError::compile(target, e))
}

/// Rewrite `rules` for a blocking mode.
///
/// Standard mode limits blocking rules to third-party loads. Rules that
/// already set a load type are left alone.
pub fn apply_mode(rules: &[Value], mode: BlockingMode) -> Vec<Value> {
    match mode {
        BlockingMode::Standard => rules.iter().cloned().map(restrict_to_third_party).collect(),
        BlockingMode::General | BlockingMode::Aggressive => rules.to_vec(),
    }
}

fn restrict_to_third_party(mut rule: Value) -> Value {
    let is_block = rule.pointer("/action/type").and_then(Value::as_str) == Some("block");
    if is_block {
        if let Some(trigger) = rule.get_mut("trigger").and_then(Value::as_object_mut) {
            trigger
                .entry("load-type")
                .or_insert_with(|| json!(["third-party"]));
        }
    }
    rule
}

/// Validate `rules` and encode them for the native rule store.
///
/// Every rule needs a `trigger.url-filter` and an `action.type`, and an
/// empty list is rejected.
pub fn encode_rule_list(target: &str, rules: &[Value]) -> Result<String, ShieldsError> {
    if rules.is_empty() {
        return Err(ShieldsError::compile(target, "no rules"));
    }

    for (index, rule) in rules.iter().enumerate() {
        let has_filter = rule
            .pointer("/trigger/url-filter")
            .and_then(Value::as_str)
            .is_some();
        let has_action = rule.pointer("/action/type").and_then(Value::as_str).is_some();

        if !has_filter || !has_action {
            return Err(ShieldsError::compile(
                target,
                format!("rule {} needs a url-filter and an action type", index),
            ));
        }
    }

    Ok(serde_json::to_string(rules)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_text_converts_to_block_rules() {
        let rules = rules_from_filter_text("test", "||ads.example.com^\n").unwrap();
        assert!(!rules.is_empty());
        assert!(rules
            .iter()
            .any(|rule| rule.pointer("/action/type").and_then(Value::as_str) == Some("block")));
    }

    #[test]
    fn test_standard_mode_adds_third_party_to_block_rules() {
        let rules = vec![
            json!({"trigger": {"url-filter": "ads"}, "action": {"type": "block"}}),
            json!({"trigger": {"url-filter": "ok", "load-type": ["first-party"]}, "action": {"type": "block"}}),
            json!({"trigger": {"url-filter": ".*"}, "action": {"type": "ignore-previous-rules"}}),
        ];

        let standard = apply_mode(&rules, BlockingMode::Standard);
        assert_eq!(standard[0]["trigger"]["load-type"], json!(["third-party"]));
        assert_eq!(standard[1]["trigger"]["load-type"], json!(["first-party"]));
        assert!(standard[2]["trigger"].get("load-type").is_none());

        assert_eq!(apply_mode(&rules, BlockingMode::Aggressive), rules);
    }

    #[test]
    fn test_encode_rejects_invalid_rules() {
        assert!(encode_rule_list("test", &[]).is_err());
        assert!(encode_rule_list("test", &[json!({"action": {"type": "block"}})]).is_err());

        let encoded = encode_rule_list(
            "test",
            &[json!({"trigger": {"url-filter": "ads"}, "action": {"type": "block"}})],
        )
        .unwrap();
        assert!(encoded.starts_with('['));
    }

    #[test]
    fn test_rules_from_json_reports_target() {
        match rules_from_json("generic-block-cookies", "{") {
            Err(ShieldsError::Compile { target, .. }) => assert_eq!(target, "generic-block-cookies"),
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
