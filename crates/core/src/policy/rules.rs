use crate::types::{Condition, ConditionOperator, Logic, RuleExpr};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use tracing::warn;

/// Control fields a `modify` policy may propose
const MODIFIABLE_PREFIXES: [&str; 2] = ["limits.", "flags."];

/// Resolve a dot-separated path such as `tool.risk_level`.
/// Missing segments and explicit nulls both resolve to `None`.
pub fn resolve_field<'a>(document: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(document, |current, segment| match current {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
        .filter(|value| !value.is_null())
}

/// True when every (AND) or any (OR) condition holds; an empty list always matches
pub fn evaluate_rule(rule: &RuleExpr, document: &Value) -> bool {
    if rule.conditions.is_empty() {
        return true;
    }

    match rule.logic {
        Logic::And => rule
            .conditions
            .iter()
            .all(|c| evaluate_condition(c, document)),
        Logic::Or => rule
            .conditions
            .iter()
            .any(|c| evaluate_condition(c, document)),
    }
}

pub fn evaluate_condition(condition: &Condition, document: &Value) -> bool {
    let actual = resolve_field(document, &condition.field);
    let expected = &condition.value;

    match &condition.operator {
        ConditionOperator::Equals => actual.is_some_and(|v| values_equal(v, expected)),
        ConditionOperator::NotEquals => !actual.is_some_and(|v| values_equal(v, expected)),
        ConditionOperator::In => match expected {
            Value::Array(options) => {
                actual.is_some_and(|v| options.iter().any(|o| values_equal(v, o)))
            }
            _ => false,
        },
        ConditionOperator::NotIn => match expected {
            Value::Array(options) => {
                !actual.is_some_and(|v| options.iter().any(|o| values_equal(v, o)))
            }
            _ => false,
        },
        ConditionOperator::GreaterThan => compare_numbers(actual, expected) == Some(Ordering::Greater),
        ConditionOperator::LessThan => compare_numbers(actual, expected) == Some(Ordering::Less),
        ConditionOperator::Contains => match (actual, expected) {
            (Some(Value::String(haystack)), Value::String(needle)) => haystack.contains(needle.as_str()),
            (Some(Value::Array(items)), needle) => items.iter().any(|i| values_equal(i, needle)),
            _ => false,
        },
        ConditionOperator::StartsWith => match (actual, expected) {
            (Some(Value::String(s)), Value::String(prefix)) => s.starts_with(prefix.as_str()),
            _ => false,
        },
        ConditionOperator::EndsWith => match (actual, expected) {
            (Some(Value::String(s)), Value::String(suffix)) => s.ends_with(suffix.as_str()),
            _ => false,
        },
        ConditionOperator::Exists => actual.is_some(),
        ConditionOperator::NotExists => actual.is_none(),
        ConditionOperator::Unsupported(op) => {
            warn!(operator = %op, field = %condition.field, "Unsupported policy operator");
            false
        }
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn compare_numbers(actual: Option<&Value>, expected: &Value) -> Option<Ordering> {
    let a = actual?.as_f64()?;
    let b = expected.as_f64()?;
    a.partial_cmp(&b)
}

/// Control fields proposed by a `modify` rule, read from its `equals` conditions.
/// `limits.max_llm_calls = 5` becomes `{"limits": {"max_llm_calls": 5}}`.
pub fn modified_context(rule: &RuleExpr) -> Map<String, Value> {
    let mut modified = Map::new();

    for condition in &rule.conditions {
        if condition.operator != ConditionOperator::Equals {
            continue;
        }

        if condition.field == "mode" {
            modified.insert("mode".to_string(), condition.value.clone());
            continue;
        }

        let Some(prefix) = MODIFIABLE_PREFIXES
            .iter()
            .find(|p| condition.field.starts_with(**p))
        else {
            continue;
        };
        let group = prefix.trim_end_matches('.');
        let key = &condition.field[prefix.len()..];
        if key.is_empty() {
            continue;
        }

        if let Value::Object(section) = modified
            .entry(group.to_string())
            .or_insert_with(|| Value::Object(Map::new()))
        {
            section.insert(key.to_string(), condition.value.clone());
        }
    }

    modified
}
