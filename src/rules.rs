use crate::message::HeaderEntry;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One rewrite requirement, keyed by header name in the configuration.
///
/// `true` means the header only has to be present; a string has to equal the
/// header value exactly; a list matches if any entry equals the value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequireValue {
    Present(bool),
    Equals(String),
    OneOf(Vec<String>),
}

/// Header-name → requirement mapping from `rewrite.require`.
pub type RequireRules = HashMap<String, RequireValue>;

/// Decide whether a message qualifies for forward rewriting.
///
/// Empty rules always qualify. Otherwise any single match is enough: header
/// names compare case-insensitively, values case-sensitively after trimming
/// surrounding whitespace (milter header values arrive with a leading space).
pub fn should_rewrite(rules: &RequireRules, headers: &[HeaderEntry]) -> bool {
    if rules.is_empty() {
        return true;
    }

    for header in headers {
        let rule = rules
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(&header.name))
            .map(|(_, value)| value);
        let Some(rule) = rule else {
            continue;
        };

        let value = header.value.trim();
        let matched = match rule {
            RequireValue::Present(present) => *present,
            RequireValue::Equals(expected) => value == expected,
            RequireValue::OneOf(expected) => expected.iter().any(|e| e == value),
        };
        if matched {
            log::debug!("rewrite requirement met by header {}", header.name);
            return true;
        }
    }

    false
}
