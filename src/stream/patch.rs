//! Patch decoding and application.
//!
//! Deltas arrive in two shapes. The append fast path `[[...path, value], 9, 9]`
//! concatenates `value` onto the string found by walking `path`. Everything else
//! is a structural diff in the jsondiffpatch delta format. Both are decoded once
//! into [`Patch`] at the frame boundary, so application never re-inspects shape.

use serde_json::{Map, Value};
use thiserror::Error;

const APPEND_MARKER: u64 = 9;
const OP_DELETE: u64 = 0;
const OP_TEXT_DIFF: u64 = 2;
const OP_MOVE: u64 = 3;
const ARRAY_DIFF_MARKER: &str = "a";

#[derive(Debug, Error, Clone, PartialEq)]
pub enum PatchError {
    #[error("malformed delta at {at}: {reason}")]
    Malformed { at: String, reason: String },
    #[error("append path {0} does not resolve to a string")]
    NotAString(String),
    #[error("path {0} does not exist in the document")]
    PathNotFound(String),
    #[error("text diffs are not supported (at {0})")]
    UnsupportedTextDiff(String),
    #[error("index {index} out of bounds for array of length {len} at {at}")]
    OutOfBounds { at: String, index: usize, len: usize },
    #[error("cannot apply {expected} delta to {found} at {at}")]
    TypeMismatch {
        at: String,
        expected: &'static str,
        found: &'static str,
    },
}

fn malformed(at: &str, reason: impl Into<String>) -> PatchError {
    PatchError::Malformed {
        at: at.to_string(),
        reason: reason.into(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    Index(usize),
    Key(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Patch {
    Append {
        path: Vec<PathSegment>,
        text: String,
    },
    Structural(Diff),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Diff {
    Added(Value),
    Replaced(Value),
    Deleted,
    TextDiff(String),
    Object(Vec<(String, Diff)>),
    Array(ArrayDiff),
}

/// Array changes; removal indexes refer to the old array, change indexes to the new one.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ArrayDiff {
    pub removals: Vec<(usize, Removal)>,
    pub changes: Vec<(usize, Diff)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    Delete,
    MoveTo(usize),
}

// ============================================================================
// Decoding
// ============================================================================

impl Patch {
    pub fn from_value(delta: &Value) -> Result<Self, PatchError> {
        if let Some(append) = Self::decode_append(delta)? {
            return Ok(append);
        }
        Diff::from_value(delta, "$").map(Patch::Structural)
    }

    fn decode_append(delta: &Value) -> Result<Option<Self>, PatchError> {
        let Some([target, a, b]) = delta.as_array().map(Vec::as_slice) else {
            return Ok(None);
        };
        if a.as_u64() != Some(APPEND_MARKER) || b.as_u64() != Some(APPEND_MARKER) {
            return Ok(None);
        }
        let Some((value, segments)) = target.as_array().and_then(|t| t.split_last()) else {
            return Ok(None);
        };
        if segments.is_empty() {
            return Ok(None);
        }

        let path = segments
            .iter()
            .map(|segment| match segment {
                Value::String(key) => Ok(PathSegment::Key(key.clone())),
                Value::Number(n) => n
                    .as_u64()
                    .map(|i| PathSegment::Index(i as usize))
                    .ok_or_else(|| malformed("$[0]", format!("invalid path index {}", n))),
                other => Err(malformed("$[0]", format!("invalid path segment {}", other))),
            })
            .collect::<Result<Vec<_>, _>>()?;

        let text = match value {
            Value::String(s) => s.clone(),
            Value::Number(_) | Value::Bool(_) => value.to_string(),
            other => return Err(malformed("$[0]", format!("cannot append {}", other))),
        };

        Ok(Some(Patch::Append { path, text }))
    }

    pub fn apply(&self, target: &mut Value) -> Result<(), PatchError> {
        match self {
            Patch::Append { path, text } => append_at(target, path, text),
            Patch::Structural(diff) => diff.apply(target),
        }
    }
}

impl Diff {
    pub fn from_value(delta: &Value, at: &str) -> Result<Self, PatchError> {
        match delta {
            Value::Array(items) => match items.as_slice() {
                [value] => Ok(Diff::Added(value.clone())),
                [_, value] => Ok(Diff::Replaced(value.clone())),
                [first, _, op] => match op.as_u64() {
                    Some(OP_DELETE) => Ok(Diff::Deleted),
                    Some(OP_TEXT_DIFF) => Ok(Diff::TextDiff(
                        first.as_str().unwrap_or_default().to_string(),
                    )),
                    Some(OP_MOVE) => Err(malformed(at, "move outside of an array diff")),
                    _ => Err(malformed(at, format!("unknown operation {}", op))),
                },
                _ => Err(malformed(at, format!("unexpected delta of length {}", items.len()))),
            },
            Value::Object(map) if map.get("_t").and_then(Value::as_str) == Some(ARRAY_DIFF_MARKER) => {
                ArrayDiff::from_map(map, at).map(Diff::Array)
            }
            Value::Object(map) => map
                .iter()
                .map(|(key, child)| {
                    Diff::from_value(child, &format!("{}.{}", at, key)).map(|d| (key.clone(), d))
                })
                .collect::<Result<Vec<_>, _>>()
                .map(Diff::Object),
            other => Err(malformed(at, format!("unexpected delta {}", other))),
        }
    }
}

impl ArrayDiff {
    fn from_map(map: &Map<String, Value>, at: &str) -> Result<Self, PatchError> {
        let mut diff = ArrayDiff::default();

        for (key, child) in map {
            if key == "_t" {
                continue;
            }
            let child_at = format!("{}[{}]", at, key);

            if let Some(old_index) = key.strip_prefix('_') {
                let index = parse_index(old_index, &child_at)?;
                let removal = match child.as_array().map(Vec::as_slice) {
                    Some([_, _, op]) if op.as_u64() == Some(OP_DELETE) => Removal::Delete,
                    Some([_, dest, op]) if op.as_u64() == Some(OP_MOVE) => {
                        let dest = dest
                            .as_u64()
                            .ok_or_else(|| malformed(&child_at, "move without destination"))?;
                        Removal::MoveTo(dest as usize)
                    }
                    _ => return Err(malformed(&child_at, "only removals and moves may use _N keys")),
                };
                diff.removals.push((index, removal));
            } else {
                let index = parse_index(key, &child_at)?;
                diff.changes.push((index, Diff::from_value(child, &child_at)?));
            }
        }

        Ok(diff)
    }
}

fn parse_index(raw: &str, at: &str) -> Result<usize, PatchError> {
    raw.parse()
        .map_err(|_| malformed(at, format!("invalid array index {:?}", raw)))
}

// ============================================================================
// Application
// ============================================================================

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn render_path(path: &[PathSegment]) -> String {
    let parts: Vec<String> = path
        .iter()
        .map(|s| match s {
            PathSegment::Index(i) => i.to_string(),
            PathSegment::Key(k) => format!("{:?}", k),
        })
        .collect();
    format!("[{}]", parts.join(","))
}

fn step_mut<'a>(value: &'a mut Value, segment: &PathSegment) -> Option<&'a mut Value> {
    match (value, segment) {
        (Value::Array(items), PathSegment::Index(i)) => items.get_mut(*i),
        (Value::Object(map), PathSegment::Index(i)) => map.get_mut(&i.to_string()),
        (Value::Object(map), PathSegment::Key(k)) => map.get_mut(k),
        (Value::Array(items), PathSegment::Key(k)) => {
            k.parse::<usize>().ok().and_then(move |i| items.get_mut(i))
        }
        _ => None,
    }
}

/// Walks `path` and appends to the first string leaf met on the way.
fn append_at(target: &mut Value, path: &[PathSegment], text: &str) -> Result<(), PatchError> {
    let mut current = target;
    for (depth, segment) in path.iter().enumerate() {
        let next = step_mut(current, segment)
            .ok_or_else(|| PatchError::PathNotFound(render_path(&path[..=depth])))?;
        if let Value::String(leaf) = next {
            if depth + 1 < path.len() {
                log::trace!("Append stopped at {} before end of path", render_path(&path[..=depth]));
            }
            leaf.push_str(text);
            return Ok(());
        }
        current = next;
    }
    Err(PatchError::NotAString(render_path(path)))
}

impl Diff {
    pub fn apply(&self, target: &mut Value) -> Result<(), PatchError> {
        self.apply_at(target, "$")
    }

    fn apply_at(&self, target: &mut Value, at: &str) -> Result<(), PatchError> {
        match self {
            Diff::Added(value) | Diff::Replaced(value) => {
                *target = value.clone();
                Ok(())
            }
            Diff::Deleted => {
                *target = Value::Null;
                Ok(())
            }
            Diff::TextDiff(_) => Err(PatchError::UnsupportedTextDiff(at.to_string())),
            Diff::Object(entries) => {
                let Value::Object(map) = target else {
                    return Err(PatchError::TypeMismatch {
                        at: at.to_string(),
                        expected: "object",
                        found: kind_of(target),
                    });
                };
                for (key, child) in entries {
                    let child_at = format!("{}.{}", at, key);
                    match child {
                        Diff::Deleted => {
                            map.remove(key);
                        }
                        Diff::Added(value) | Diff::Replaced(value) => {
                            map.insert(key.clone(), value.clone());
                        }
                        nested => {
                            let slot = map
                                .get_mut(key)
                                .ok_or_else(|| PatchError::PathNotFound(child_at.clone()))?;
                            nested.apply_at(slot, &child_at)?;
                        }
                    }
                }
                Ok(())
            }
            Diff::Array(diff) => {
                let Value::Array(items) = target else {
                    return Err(PatchError::TypeMismatch {
                        at: at.to_string(),
                        expected: "array",
                        found: kind_of(target),
                    });
                };
                diff.apply_to(items, at)
            }
        }
    }
}

impl ArrayDiff {
    fn apply_to(&self, items: &mut Vec<Value>, at: &str) -> Result<(), PatchError> {
        let mut removals = self.removals.clone();
        removals.sort_by_key(|(index, _)| *index);

        let mut insertions: Vec<(usize, Value)> = Vec::new();

        // Highest index first so earlier removals don't shift later ones.
        for (index, removal) in removals.into_iter().rev() {
            if index >= items.len() {
                return Err(PatchError::OutOfBounds {
                    at: at.to_string(),
                    index,
                    len: items.len(),
                });
            }
            let removed = items.remove(index);
            if let Removal::MoveTo(dest) = removal {
                insertions.push((dest, removed));
            }
        }

        let mut modifications = Vec::new();
        for (index, change) in &self.changes {
            match change {
                Diff::Added(value) => insertions.push((*index, value.clone())),
                other => modifications.push((*index, other)),
            }
        }

        insertions.sort_by_key(|(index, _)| *index);
        for (index, value) in insertions {
            let index = index.min(items.len());
            items.insert(index, value);
        }

        for (index, change) in modifications {
            let len = items.len();
            let slot = items.get_mut(index).ok_or_else(|| PatchError::OutOfBounds {
                at: at.to_string(),
                index,
                len,
            })?;
            change.apply_at(slot, &format!("{}[{}]", at, index))?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn patched(mut doc: Value, delta: Value) -> Result<Value, PatchError> {
        Patch::from_value(&delta)?.apply(&mut doc)?;
        Ok(doc)
    }

    #[test]
    fn test_append_shape_decodes_to_append() {
        let patch = Patch::from_value(&json!([[0, 2, "lo"], 9, 9])).unwrap();
        assert_eq!(
            patch,
            Patch::Append {
                path: vec![PathSegment::Index(0), PathSegment::Index(2)],
                text: "lo".to_string()
            }
        );
    }

    #[test]
    fn test_append_fast_path_extends_leaf() {
        let doc = json!([["text", {}, "hel"]]);
        let out = patched(doc, json!([[0, 2, "lo"], 9, 9])).unwrap();
        assert_eq!(out, json!([["text", {}, "hello"]]));
    }

    #[test]
    fn test_generic_patch_reaches_same_result() {
        let doc = json!([["text", {}, "hel"]]);
        let fast = patched(doc.clone(), json!([[0, 2, "lo"], 9, 9])).unwrap();
        let generic = patched(
            doc,
            json!({"_t": "a", "0": {"_t": "a", "2": ["hel", "hello"]}}),
        )
        .unwrap();
        assert_eq!(fast, generic);
    }

    #[test]
    fn test_append_walks_object_keys() {
        let doc = json!([[0, [["AssistantMessageContentPart", {"part": {"content": "Look"}}]]]]);
        let out = patched(
            doc,
            json!([[0, 1, 0, 1, "part", "content", "ing"], 9, 9]),
        )
        .unwrap();
        assert_eq!(out[0][1][0][1]["part"]["content"], json!("Looking"));
    }

    #[test]
    fn test_append_to_non_string_fails() {
        let err = patched(json!([[1, 2]]), json!([[0, 1, "x"], 9, 9])).unwrap_err();
        assert!(matches!(err, PatchError::NotAString(_)));

        let err = patched(json!([]), json!([[3, "x"], 9, 9])).unwrap_err();
        assert!(matches!(err, PatchError::PathNotFound(_)));
    }

    #[test]
    fn test_array_insert_and_delete() {
        let doc = json!(["a", "b", "c"]);
        let out = patched(doc, json!({"_t": "a", "_1": ["b", 0, 0], "2": ["d"]})).unwrap();
        assert_eq!(out, json!(["a", "c", "d"]));
    }

    #[test]
    fn test_array_move() {
        let doc = json!(["a", "b", "c"]);
        let out = patched(doc, json!({"_t": "a", "_0": ["", 2, 3]})).unwrap();
        assert_eq!(out, json!(["b", "c", "a"]));
    }

    #[test]
    fn test_object_changes() {
        let doc = json!({"keep": 1, "drop": 2, "nested": {"x": "old"}});
        let out = patched(
            doc,
            json!({"drop": [2, 0, 0], "added": ["new"], "nested": {"x": ["old", "new"]}}),
        )
        .unwrap();
        assert_eq!(out, json!({"keep": 1, "added": "new", "nested": {"x": "new"}}));
    }

    #[test]
    fn test_root_add_on_empty_document() {
        let out = patched(json!([]), json!({"_t": "a", "0": [[0, ["Hi"]]]})).unwrap();
        assert_eq!(out, json!([[0, ["Hi"]]]));
    }

    #[test]
    fn test_text_diff_unsupported() {
        let err = patched(json!({"s": "abc"}), json!({"s": ["@@ -1 +1 @@", 0, 2]})).unwrap_err();
        assert!(matches!(err, PatchError::UnsupportedTextDiff(_)));
    }

    #[test]
    fn test_malformed_shapes_rejected() {
        assert!(Patch::from_value(&json!("nope")).is_err());
        assert!(Patch::from_value(&json!([1, 2, 3, 4])).is_err());
        assert!(Patch::from_value(&json!({"_t": "a", "_0": ["x"]})).is_err());
        assert!(Patch::from_value(&json!({"_t": "a", "zz": ["x"]})).is_err());
    }

    #[test]
    fn test_out_of_bounds_removal_fails() {
        let err = patched(json!(["a"]), json!({"_t": "a", "_4": ["x", 0, 0]})).unwrap_err();
        assert!(matches!(err, PatchError::OutOfBounds { index: 4, .. }));
    }
}
