//! Form schema model and the walker that flattens it into addressable fields.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde_json::Value;

use crate::error::{Error, Result};
use crate::path_value;

const MAX_DEPTH: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LeafType {
    Float,
    Integer,
    UnsignedInteger,
    Text,
    Boolean,
}

impl LeafType {
    pub fn as_str(self) -> &'static str {
        match self {
            LeafType::Float => "float",
            LeafType::Integer => "integer",
            LeafType::UnsignedInteger => "unsigned_integer",
            LeafType::Text => "text",
            LeafType::Boolean => "boolean",
        }
    }

    pub fn is_numeric(self) -> bool {
        matches!(
            self,
            LeafType::Float | LeafType::Integer | LeafType::UnsignedInteger
        )
    }

    /// Whether `v` is a value this leaf may hold.
    pub fn accepts(self, v: &Value) -> bool {
        match self {
            LeafType::Float => v.is_number(),
            LeafType::Integer => v.is_i64() || v.is_u64(),
            LeafType::UnsignedInteger => v.is_u64(),
            LeafType::Text => v.is_string(),
            LeafType::Boolean => v.is_boolean(),
        }
    }
}

impl fmt::Display for LeafType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LeafType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "float" => Ok(LeafType::Float),
            "integer" => Ok(LeafType::Integer),
            "unsigned_integer" => Ok(LeafType::UnsignedInteger),
            "text" | "string" => Ok(LeafType::Text),
            "boolean" | "bool" => Ok(LeafType::Boolean),
            other => Err(Error::msg(format!("unknown field type '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    Object(Vec<(String, SchemaNode)>),
    Leaf(LeafType),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SchemaNode {
    pub label: String,
    pub kind: NodeKind,
    /// Server-assigned path; wins over the key chain when present.
    pub path: Option<String>,
}

/// Top-level form: an ordered list of named root nodes.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Schema {
    pub roots: Vec<(String, SchemaNode)>,
}

fn field<'a>(obj: &'a serde_json::Map<String, Value>, key: &str) -> Option<&'a Value> {
    obj.get(key).or_else(|| {
        let mut cs = key.chars();
        let pascal: String = cs
            .next()
            .map(|c| c.to_ascii_uppercase())
            .into_iter()
            .chain(cs)
            .collect();
        obj.get(&pascal)
    })
}

fn is_node(obj: &serde_json::Map<String, Value>) -> bool {
    field(obj, "type").is_some()
}

impl SchemaNode {
    pub fn from_json(name: &str, v: &Value) -> Result<Self> {
        Self::parse(name, v, 0)
    }

    fn parse(name: &str, v: &Value, depth: usize) -> Result<Self> {
        if depth > MAX_DEPTH {
            return Err(Error::msg(format!(
                "schema nesting exceeds {MAX_DEPTH} levels at '{name}'"
            )));
        }
        let Some(obj) = v.as_object() else {
            return Err(Error::msg(format!("schema node '{name}' is not an object")));
        };
        let label = field(obj, "label")
            .and_then(Value::as_str)
            .unwrap_or(name)
            .to_string();
        let ty = field(obj, "type")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::msg(format!("schema node '{name}' has no type")))?;
        let path = field(obj, "path")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(crate::path_value::normalize);
        let fields = field(obj, "fields");

        let kind = if ty.eq_ignore_ascii_case("object") {
            let Some(children) = fields.and_then(Value::as_object) else {
                return Err(Error::msg(format!(
                    "object node '{name}' must declare fields"
                )));
            };
            if children.is_empty() {
                return Err(Error::msg(format!("object node '{name}' has no fields")));
            }
            let mut out = Vec::with_capacity(children.len());
            for (k, child) in children {
                out.push((k.clone(), Self::parse(k, child, depth + 1)?));
            }
            NodeKind::Object(out)
        } else {
            if fields.is_some_and(|f| !f.is_null()) {
                return Err(Error::msg(format!(
                    "leaf node '{name}' of type '{ty}' must not declare fields"
                )));
            }
            NodeKind::Leaf(ty.parse()?)
        };

        Ok(Self { label, kind, path })
    }
}

impl Schema {
    /// Accepts either a single root node or a bare mapping of named roots.
    pub fn from_json(v: &Value) -> Result<Self> {
        let Some(obj) = v.as_object() else {
            return Err(Error::msg("form schema must be a JSON object"));
        };
        if is_node(obj) {
            let node = SchemaNode::from_json("", v)?;
            return Ok(Self {
                roots: vec![(String::new(), node)],
            });
        }
        let mut roots = Vec::with_capacity(obj.len());
        for (k, child) in obj {
            roots.push((k.clone(), SchemaNode::from_json(k, child)?));
        }
        Ok(Self { roots })
    }

    pub fn leaf_count(&self) -> usize {
        fn count(n: &SchemaNode) -> usize {
            match &n.kind {
                NodeKind::Leaf(_) => 1,
                NodeKind::Object(children) => children.iter().map(|(_, c)| count(c)).sum(),
            }
        }
        self.roots.iter().map(|(_, n)| count(n)).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescriptor {
    pub path: String,
    pub label: String,
    pub level: usize,
    pub leaf: LeafType,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormEntry {
    Heading {
        path: String,
        label: String,
        level: usize,
    },
    Field(FieldDescriptor),
}

impl FormEntry {
    pub fn level(&self) -> usize {
        match self {
            FormEntry::Heading { level, .. } => *level,
            FormEntry::Field(f) => f.level,
        }
    }

    pub fn label(&self) -> &str {
        match self {
            FormEntry::Heading { label, .. } => label,
            FormEntry::Field(f) => &f.label,
        }
    }

    pub fn as_field(&self) -> Option<&FieldDescriptor> {
        match self {
            FormEntry::Field(f) => Some(f),
            FormEntry::Heading { .. } => None,
        }
    }
}

fn child_path(parent: &str, key: &str) -> String {
    if parent.is_empty() {
        key.to_string()
    } else if key.is_empty() {
        parent.to_string()
    } else {
        format!("{parent}.{key}")
    }
}

/// Pre-order expansion: heading before children, children in declared order.
pub fn expand(schema: &Schema) -> Result<Vec<FormEntry>> {
    let mut out = Vec::new();
    for (key, node) in &schema.roots {
        out.extend(expand_node(key, node, "", 0));
    }

    check_bindings(&out)?;
    Ok(out)
}

/// Every field must own its path outright: no other field or heading may
/// sit at it or below it, otherwise writes to one would clobber the other.
fn check_bindings(entries: &[FormEntry]) -> Result<()> {
    let mut fields = BTreeSet::new();
    let mut headings = BTreeSet::new();
    for entry in entries {
        match entry {
            FormEntry::Field(f) => {
                if !fields.insert(path_value::normalize(&f.path)) {
                    return Err(Error::msg(format!(
                        "schema declares field path '{}' more than once",
                        f.path
                    )));
                }
            }
            FormEntry::Heading { path, .. } => {
                headings.insert(path_value::normalize(path));
            }
        }
    }

    for field in &fields {
        if headings.contains(field) {
            return Err(Error::msg(format!(
                "field path '{field}' is also a section path"
            )));
        }
        let below = format!("{field}.");
        let nested = [&fields, &headings].into_iter().find_map(|set| {
            set.range(below.clone()..)
                .next()
                .filter(|p| p.starts_with(&below))
        });
        if let Some(other) = nested {
            return Err(Error::msg(format!(
                "field path '{field}' overlaps '{other}'"
            )));
        }
    }
    Ok(())
}

fn expand_node(key: &str, node: &SchemaNode, parent: &str, level: usize) -> Vec<FormEntry> {
    let path = node
        .path
        .clone()
        .unwrap_or_else(|| child_path(parent, key));
    match &node.kind {
        NodeKind::Leaf(leaf) => vec![FormEntry::Field(FieldDescriptor {
            path,
            label: node.label.clone(),
            level,
            leaf: *leaf,
        })],
        NodeKind::Object(children) => {
            let heading = FormEntry::Heading {
                path: path.clone(),
                label: node.label.clone(),
                level,
            };
            std::iter::once(heading)
                .chain(
                    children
                        .iter()
                        .flat_map(|(k, c)| expand_node(k, c, &path, level + 1)),
                )
                .collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn traits_form() -> Value {
        json!({
            "Traits": {
                "Label": "Traits",
                "Type": "object",
                "Fields": {
                    "StopLoss": {
                        "Label": "Stop Loss",
                        "Type": "object",
                        "Fields": {
                            "Min": {"Label": "Min", "Type": "float"},
                            "Max": {"Label": "Max", "Type": "float"}
                        }
                    },
                    "MinimumHoldingPeriods": {
                        "Label": "Minimum Holding Periods",
                        "Type": "unsigned_integer",
                        "Path": "Traits.MinimumHoldingPeriods"
                    }
                }
            },
            "StartingMoney": {"Label": "Starting Money", "Type": "float"}
        })
    }

    #[test]
    fn expands_in_pre_order_with_levels() {
        let schema = Schema::from_json(&traits_form()).unwrap();
        let entries = expand(&schema).unwrap();
        let got: Vec<(usize, &str)> = entries.iter().map(|e| (e.level(), e.label())).collect();
        assert_eq!(
            got,
            vec![
                (0, "Traits"),
                (1, "Stop Loss"),
                (2, "Min"),
                (2, "Max"),
                (1, "Minimum Holding Periods"),
                (0, "Starting Money"),
            ]
        );
        let paths: Vec<&str> = entries
            .iter()
            .filter_map(FormEntry::as_field)
            .map(|f| f.path.as_str())
            .collect();
        assert_eq!(
            paths,
            vec![
                "Traits.StopLoss.Min",
                "Traits.StopLoss.Max",
                "Traits.MinimumHoldingPeriods",
                "StartingMoney"
            ]
        );
    }

    #[test]
    fn field_count_matches_leaf_count() {
        let schema = Schema::from_json(&traits_form()).unwrap();
        let fields = expand(&schema)
            .unwrap()
            .into_iter()
            .filter(|e| e.as_field().is_some())
            .count();
        assert_eq!(fields, schema.leaf_count());
        assert_eq!(fields, 4);
    }

    #[test]
    fn single_root_node_is_accepted() {
        let schema = Schema::from_json(&json!({
            "label": "Root",
            "type": "object",
            "fields": {"name": {"label": "Name", "type": "text"}}
        }))
        .unwrap();
        let entries = expand(&schema).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].as_field().unwrap().path, "name");
    }

    #[test]
    fn duplicate_explicit_paths_are_rejected() {
        let schema = Schema::from_json(&json!({
            "a": {"label": "A", "type": "integer", "path": "x"},
            "b": {"label": "B", "type": "integer", "path": "x"}
        }))
        .unwrap();
        let err = expand(&schema).unwrap_err();
        assert!(err.to_string().contains("'x'"));
    }

    #[test]
    fn overlapping_paths_are_rejected() {
        let nested_leaf = Schema::from_json(&json!({
            "a": {"label": "A", "type": "float", "path": "x"},
            "b": {"label": "B", "type": "float", "path": "x.y"}
        }))
        .unwrap();
        let err = expand(&nested_leaf).unwrap_err();
        assert!(err.to_string().contains("'x.y'"), "{err}");

        let slash_form = Schema::from_json(&json!({
            "a": {"label": "A", "type": "float", "path": "x/y"},
            "b": {"label": "B", "type": "float", "path": "x"}
        }))
        .unwrap();
        assert!(expand(&slash_form).is_err());

        let leaf_on_section = Schema::from_json(&json!({
            "T": {"label": "T", "type": "object", "fields": {
                "a": {"label": "A", "type": "integer"}
            }},
            "b": {"label": "B", "type": "integer", "path": "T"}
        }))
        .unwrap();
        let err = expand(&leaf_on_section).unwrap_err();
        assert!(err.to_string().contains("section"), "{err}");

        let siblings = Schema::from_json(&json!({
            "a": {"label": "A", "type": "float", "path": "x"},
            "b": {"label": "B", "type": "float", "path": "xy"}
        }))
        .unwrap();
        assert_eq!(expand(&siblings).unwrap().len(), 2);
    }

    #[test]
    fn structural_violations_are_errors() {
        assert!(Schema::from_json(&json!({"a": {"label": "A", "type": "object"}})).is_err());
        assert!(
            Schema::from_json(&json!({"a": {"label": "A", "type": "object", "fields": {}}}))
                .is_err()
        );
        assert!(
            Schema::from_json(&json!({
                "a": {"label": "A", "type": "float", "fields": {"b": {"type": "float"}}}
            }))
            .is_err()
        );
        assert!(Schema::from_json(&json!({"a": {"label": "A", "type": "date"}})).is_err());
    }

    #[test]
    fn excessive_depth_is_rejected() {
        let mut node = json!({"label": "leaf", "type": "integer"});
        for _ in 0..(MAX_DEPTH + 2) {
            node = json!({"label": "o", "type": "object", "fields": {"n": node}});
        }
        assert!(Schema::from_json(&json!({"root": node})).is_err());
    }

    #[test]
    fn leaf_type_accepts_matching_values() {
        assert!(LeafType::UnsignedInteger.accepts(&json!(3)));
        assert!(!LeafType::UnsignedInteger.accepts(&json!(-3)));
        assert!(LeafType::Float.accepts(&json!(3)));
        assert!(!LeafType::Text.accepts(&json!(3)));
    }
}
