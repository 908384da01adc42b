//! Parsing of registry pod-selector strings
//!
//! Bindings store their pod selector as a label-query expression
//! (`app=demo,tier!=canary,env in (dev,staging)`), the same grammar the
//! API server accepts in `labelSelector` query parameters. kube's
//! [`Selector`] knows how to match but not how to parse the string form,
//! so the parsing lives here.

use std::collections::BTreeSet;

use kube::core::labels::{Expression, Selector};
// matching lives on an extension trait; re-exported so callers get both
pub use kube::core::labels::SelectorExt;

use crate::error::{Error, Result};

/// Parse a label-query expression into a matchable [`Selector`]
///
/// A malformed selector is an error, never an empty selector: silently
/// treating garbage as match-nothing would hide registry corruption.
pub fn parse_selector(input: &str) -> Result<Selector> {
    let err = |message: &str| Error::Selector {
        selector: input.to_string(),
        message: message.to_string(),
    };

    let mut expressions = Vec::new();
    for requirement in split_requirements(input) {
        let requirement = requirement.trim();
        if requirement.is_empty() {
            continue;
        }

        if let Some(key) = requirement.strip_prefix('!') {
            let key = key.trim();
            validate_key(key).map_err(|m| err(&m))?;
            expressions.push(Expression::DoesNotExist(key.to_string()));
        } else if let Some((key, values)) = split_set_op(requirement, " notin ") {
            validate_key(&key).map_err(|m| err(&m))?;
            expressions.push(Expression::NotIn(key, parse_values(&values).map_err(|m| err(&m))?));
        } else if let Some((key, values)) = split_set_op(requirement, " in ") {
            validate_key(&key).map_err(|m| err(&m))?;
            expressions.push(Expression::In(key, parse_values(&values).map_err(|m| err(&m))?));
        } else if let Some((key, value)) = requirement.split_once("!=") {
            let (key, value) = (key.trim(), value.trim());
            validate_key(key).map_err(|m| err(&m))?;
            validate_value(value).map_err(|m| err(&m))?;
            expressions.push(Expression::NotEqual(key.to_string(), value.to_string()));
        } else if let Some((key, value)) = split_equality(requirement) {
            validate_key(&key).map_err(|m| err(&m))?;
            validate_value(&value).map_err(|m| err(&m))?;
            expressions.push(Expression::Equal(key, value));
        } else {
            validate_key(requirement).map_err(|m| err(&m))?;
            expressions.push(Expression::Exists(requirement.to_string()));
        }
    }

    Ok(expressions.into_iter().collect())
}

/// Split on commas outside of `in (...)` value lists
fn split_requirements(input: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    for (i, c) in input.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                parts.push(&input[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&input[start..]);
    parts
}

fn split_set_op(requirement: &str, op: &str) -> Option<(String, String)> {
    let (key, rest) = requirement.split_once(op)?;
    Some((key.trim().to_string(), rest.trim().to_string()))
}

fn split_equality(requirement: &str) -> Option<(String, String)> {
    let (key, value) = if let Some((k, v)) = requirement.split_once("==") {
        (k, v)
    } else {
        requirement.split_once('=')?
    };
    Some((key.trim().to_string(), value.trim().to_string()))
}

fn parse_values(raw: &str) -> std::result::Result<BTreeSet<String>, String> {
    let inner = raw
        .strip_prefix('(')
        .and_then(|s| s.strip_suffix(')'))
        .ok_or_else(|| "set values must be parenthesized".to_string())?;
    let values: BTreeSet<String> = inner
        .split(',')
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .collect();
    if values.is_empty() {
        return Err("empty value set".to_string());
    }
    for v in &values {
        validate_value(v)?;
    }
    Ok(values)
}

fn validate_key(key: &str) -> std::result::Result<(), String> {
    if key.is_empty() {
        return Err("empty label key".to_string());
    }
    let valid = key
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/'));
    if !valid {
        return Err(format!("invalid character in label key {key:?}"));
    }
    Ok(())
}

fn validate_value(value: &str) -> std::result::Result<(), String> {
    let valid = value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if !valid {
        return Err(format!("invalid character in label value {value:?}"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn equality_and_comma_joined() {
        let selector = parse_selector("studio.dev/name=app,app=test").unwrap();
        assert!(selector.matches(&labels(&[
            ("app", "test"),
            ("studio.dev/name", "app"),
            ("others", "dev"),
        ])));
        assert!(!selector.matches(&labels(&[("app", "test")])));
    }

    #[test]
    fn double_equals_is_equality() {
        let selector = parse_selector("app==demo").unwrap();
        assert!(selector.matches(&labels(&[("app", "demo")])));
    }

    #[test]
    fn inequality() {
        let selector = parse_selector("tier!=canary").unwrap();
        assert!(selector.matches(&labels(&[("tier", "stable")])));
        assert!(selector.matches(&labels(&[])));
        assert!(!selector.matches(&labels(&[("tier", "canary")])));
    }

    #[test]
    fn set_operations() {
        let selector = parse_selector("env in (dev, staging)").unwrap();
        assert!(selector.matches(&labels(&[("env", "dev")])));
        assert!(!selector.matches(&labels(&[("env", "prod")])));

        let selector = parse_selector("env notin (prod)").unwrap();
        assert!(selector.matches(&labels(&[("env", "dev")])));
        assert!(selector.matches(&labels(&[])));
        assert!(!selector.matches(&labels(&[("env", "prod")])));
    }

    #[test]
    fn existence() {
        let selector = parse_selector("app,!legacy").unwrap();
        assert!(selector.matches(&labels(&[("app", "x")])));
        assert!(!selector.matches(&labels(&[("app", "x"), ("legacy", "1")])));
        assert!(!selector.matches(&labels(&[])));
    }

    #[test]
    fn empty_selector_matches_everything() {
        let selector = parse_selector("").unwrap();
        assert!(selector.matches(&labels(&[("anything", "goes")])));
    }

    #[test]
    fn malformed_selectors_are_errors() {
        assert!(parse_selector("=v").is_err());
        assert!(parse_selector("key=val ue").is_err());
        assert!(parse_selector("env in dev").is_err());
        assert!(parse_selector("env in ()").is_err());
        assert!(parse_selector("k ey=v").is_err());
    }
}
