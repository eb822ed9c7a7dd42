//! Evaluation of simple contact queries against a flow contact.
//!
//! Supported syntax is a list of conditions joined by `AND` or `OR` (no
//! parentheses, `AND` binds tighter), where each condition is
//! `attribute operator value` and operators are `=`, `!=`, `~`, `>`, `<`,
//! `>=` and `<=`. Attributes are `name`, `language`, `status`, `uuid`,
//! `id`, `group`, a URN scheme such as `tel`, or a field key.

use crate::{EngineError, EngineResult, FlowContact};

const OPERATORS: &[&str] = &["!=", ">=", "<=", "=", "~", ">", "<"];

#[derive(Debug, Clone, PartialEq)]
struct Condition {
    attribute: String,
    operator: &'static str,
    value: String,
}

pub fn matches(contact: &FlowContact, query: &str) -> EngineResult<bool> {
    let query = query.trim();
    if query.is_empty() {
        return Err(invalid(query, "empty query"));
    }
    for clause in split_keyword(query, "OR") {
        let mut all = true;
        for condition in split_keyword(&clause, "AND") {
            let condition = parse_condition(query, &condition)?;
            if !evaluate(contact, &condition) {
                all = false;
                break;
            }
        }
        if all {
            return Ok(true);
        }
    }
    Ok(false)
}

fn split_keyword(text: &str, keyword: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = Vec::new();
    for word in text.split_whitespace() {
        if word.eq_ignore_ascii_case(keyword) {
            parts.push(current.join(" "));
            current.clear();
        } else {
            current.push(word);
        }
    }
    parts.push(current.join(" "));
    parts
}

fn parse_condition(query: &str, text: &str) -> EngineResult<Condition> {
    for op in OPERATORS {
        if let Some((attribute, value)) = text.split_once(op) {
            let attribute = attribute.trim().to_lowercase();
            let value = value.trim().trim_matches('"').to_string();
            if attribute.is_empty() {
                return Err(invalid(query, "missing attribute"));
            }
            return Ok(Condition {
                attribute,
                operator: *op,
                value,
            });
        }
    }
    Err(invalid(query, &format!("no operator in '{text}'")))
}

fn evaluate(contact: &FlowContact, condition: &Condition) -> bool {
    let candidates: Vec<String> = match condition.attribute.as_str() {
        "group" => contact.groups.iter().map(|g| g.name.clone()).collect(),
        "urn" => contact.urns.iter().map(|u| u.path().to_string()).collect(),
        scheme if contact.urns.iter().any(|u| u.scheme() == scheme) => contact
            .urns
            .iter()
            .filter(|u| u.scheme() == scheme)
            .map(|u| u.path().to_string())
            .collect(),
        key => contact.value_of(key).into_iter().collect(),
    };

    // "attr = ''" and "attr != ''" test for presence
    if condition.value.is_empty() {
        return match condition.operator {
            "=" => candidates.is_empty(),
            "!=" => !candidates.is_empty(),
            _ => false,
        };
    }

    let expected = condition.value.to_lowercase();
    match condition.operator {
        "!=" => candidates.iter().all(|c| c.to_lowercase() != expected),
        "=" => candidates.iter().any(|c| c.to_lowercase() == expected),
        "~" => candidates.iter().any(|c| c.to_lowercase().contains(&expected)),
        op => candidates.iter().any(|c| compare_numeric(c, &condition.value, op)),
    }
}

fn compare_numeric(actual: &str, expected: &str, op: &str) -> bool {
    let (Ok(actual), Ok(expected)) = (actual.trim().parse::<f64>(), expected.parse::<f64>()) else {
        return false;
    };
    match op {
        ">" => actual > expected,
        "<" => actual < expected,
        ">=" => actual >= expected,
        "<=" => actual <= expected,
        _ => false,
    }
}

fn invalid(query: &str, reason: &str) -> EngineError {
    EngineError::InvalidQuery {
        query: query.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::Utc;
    use mailroom_models::{ContactID, ContactStatus, ContactUUID, FieldValue, GroupUUID, URN};

    use super::*;
    use crate::GroupRef;

    fn contact() -> FlowContact {
        let mut fields = BTreeMap::new();
        fields.insert("age".to_string(), FieldValue::parse("37"));
        fields.insert("state".to_string(), FieldValue::parse("Kigali"));
        FlowContact {
            id: ContactID(1),
            uuid: ContactUUID::new(),
            name: Some("Cathy".to_string()),
            language: Some("eng".to_string()),
            status: ContactStatus::Active,
            timezone: None,
            created_on: Utc::now(),
            last_seen_on: None,
            urns: vec![URN::parse("tel:+250788123123").unwrap()],
            groups: vec![GroupRef {
                uuid: GroupUUID::new(),
                name: "Testers".to_string(),
            }],
            fields,
            tickets: vec![],
        }
    }

    #[test]
    fn query_conditions_match() {
        let c = contact();
        assert!(matches(&c, "age > 30").unwrap());
        assert!(!matches(&c, "age < 30").unwrap());
        assert!(matches(&c, "name ~ cat AND state = kigali").unwrap());
        assert!(matches(&c, "age < 10 OR group = Testers").unwrap());
        assert!(matches(&c, "tel ~ 788").unwrap());
        assert!(matches(&c, "gender = \"\"").unwrap());
        assert!(!matches(&c, "status != active").unwrap());
    }

    #[test]
    fn query_without_operator_is_invalid() {
        assert!(matches!(
            matches(&contact(), "age"),
            Err(EngineError::InvalidQuery { .. })
        ));
    }
}
