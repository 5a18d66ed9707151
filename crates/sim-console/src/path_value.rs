//! Get/set over a nested JSON tree addressed by a `.`- or `/`-delimited path.
//!
//! `set` never mutates its input: it returns a fresh tree, so earlier
//! versions stay valid snapshots for anyone still holding them.

use serde_json::{Map, Value};

use crate::error::{Error, Result};

pub fn segments(path: &str) -> Vec<&str> {
    path.split(['.', '/'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}

/// Canonical dotted form of a path (`a/b.c` -> `a.b.c`).
pub fn normalize(path: &str) -> String {
    segments(path).join(".")
}

pub fn get<'a>(tree: &'a Value, path: &str) -> Option<&'a Value> {
    let mut cur = tree;
    for seg in segments(path) {
        cur = match cur {
            Value::Object(map) => map.get(seg)?,
            Value::Array(items) => items.get(seg.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(cur)
}

pub fn set(tree: &Value, path: &str, value: Value) -> Result<Value> {
    let segs = segments(path);
    let mut out = tree.clone();
    set_in(&mut out, &segs, value, path)?;
    Ok(out)
}

fn set_in(slot: &mut Value, segs: &[&str], value: Value, full: &str) -> Result<()> {
    let Some((head, rest)) = segs.split_first() else {
        *slot = value;
        return Ok(());
    };

    if slot.is_null() {
        *slot = Value::Object(Map::new());
    }

    let child = match slot {
        Value::Object(map) => map.entry((*head).to_string()).or_insert(Value::Null),
        Value::Array(items) => {
            let idx = head.parse::<usize>().map_err(|_| {
                Error::msg(format!("path '{full}' uses non-index segment '{head}' on a list"))
            })?;
            let len = items.len();
            items.get_mut(idx).ok_or_else(|| {
                Error::msg(format!("path '{full}' index {idx} out of range (len {len})"))
            })?
        }
        _ => {
            return Err(Error::msg(format!(
                "path '{full}' collides with a scalar at '{head}'"
            )));
        }
    };

    set_in(child, rest, value, full)
}
