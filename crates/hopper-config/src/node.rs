//! Helpers for pulling typed values out of KDL nodes.
//!
//! Settings are written as child nodes with one positional argument:
//!
//! ```kdl
//! broker {
//!     listen "0.0.0.0:7070"
//!     max-retries 3
//! }
//! ```

use kdl::{KdlNode, KdlValue};
use std::collections::BTreeMap;

use crate::{ConfigError, ConfigResult};

pub(crate) fn name(node: &KdlNode) -> &str {
    node.name().value()
}

pub(crate) fn children(node: &KdlNode) -> impl Iterator<Item = &KdlNode> {
    node.children().into_iter().flat_map(|doc| doc.nodes())
}

fn first_arg(node: &KdlNode) -> Option<&KdlValue> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .map(|e| e.value())
}

pub(crate) fn first_string_arg(node: &KdlNode) -> Option<String> {
    first_arg(node)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

pub(crate) fn string_args(node: &KdlNode) -> Vec<String> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .filter_map(|e| e.value().as_string())
        .map(|s| s.to_string())
        .collect()
}

pub(crate) fn string_prop(node: &KdlNode, prop: &str) -> Option<String> {
    node.get(prop)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

pub(crate) fn string(node: &KdlNode, field: &str) -> ConfigResult<String> {
    match first_arg(node) {
        Some(v) => v
            .as_string()
            .map(|s| s.to_string())
            .ok_or_else(|| ConfigError::invalid(field, format!("expected a string, got {v}"))),
        None => Err(ConfigError::MissingField(field.to_string())),
    }
}

fn integer(node: &KdlNode, field: &str) -> ConfigResult<i128> {
    match first_arg(node) {
        Some(v) => v
            .as_integer()
            .ok_or_else(|| ConfigError::invalid(field, format!("expected an integer, got {v}"))),
        None => Err(ConfigError::MissingField(field.to_string())),
    }
}

pub(crate) fn u64_arg(node: &KdlNode, field: &str) -> ConfigResult<u64> {
    let value = integer(node, field)?;
    u64::try_from(value).map_err(|_| ConfigError::invalid(field, format!("{value} is out of range")))
}

pub(crate) fn u32_arg(node: &KdlNode, field: &str) -> ConfigResult<u32> {
    let value = integer(node, field)?;
    u32::try_from(value).map_err(|_| ConfigError::invalid(field, format!("{value} is out of range")))
}

pub(crate) fn i8_arg(node: &KdlNode, field: &str) -> ConfigResult<i8> {
    let value = integer(node, field)?;
    i8::try_from(value).map_err(|_| ConfigError::invalid(field, format!("{value} is out of range")))
}

/// A non-negative number; integers are accepted too.
pub(crate) fn f64_arg(node: &KdlNode, field: &str) -> ConfigResult<f64> {
    let value = match first_arg(node) {
        Some(v) => v
            .as_float()
            .or_else(|| v.as_integer().map(|i| i as f64))
            .ok_or_else(|| ConfigError::invalid(field, format!("expected a number, got {v}")))?,
        None => return Err(ConfigError::MissingField(field.to_string())),
    };
    if !value.is_finite() || value < 0.0 {
        return Err(ConfigError::invalid(field, format!("{value} is out of range")));
    }
    Ok(value)
}

pub(crate) fn bool_arg(node: &KdlNode, field: &str) -> ConfigResult<bool> {
    match first_arg(node) {
        Some(v) => v
            .as_bool()
            .ok_or_else(|| ConfigError::invalid(field, format!("expected #true or #false, got {v}"))),
        None => Err(ConfigError::MissingField(field.to_string())),
    }
}

/// Children of the form `KEY "value"` collected into a map.
pub(crate) fn string_map(node: &KdlNode, field: &str) -> ConfigResult<BTreeMap<String, String>> {
    let mut map = BTreeMap::new();
    for child in children(node) {
        let key = name(child).to_string();
        let value = string(child, &format!("{field}.{key}"))?;
        if map.insert(key.clone(), value).is_some() {
            return Err(ConfigError::Duplicate(format!("{field}.{key}")));
        }
    }
    Ok(map)
}
