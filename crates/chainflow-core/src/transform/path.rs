//! Dotted/indexed paths into JSON trees: `a.b[0].c`, `messages.0.content`.
//!
//! Keys may contain any character except `.`, `[` and `]`, so display-name
//! keys such as `Research Agent_result` resolve as written.

use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PathError {
    #[error("Empty path")]
    Empty,

    #[error("Malformed path '{path}': {reason}")]
    Malformed { path: String, reason: String },

    #[error("Path '{0}' not found")]
    Missing(String),

    #[error("Cannot step into {found} at '{at}'")]
    TypeMismatch { at: String, found: &'static str },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Key(String),
    Index(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Path {
    raw: String,
    segments: Vec<Segment>,
}

impl Path {
    pub fn parse(raw: &str) -> Result<Self, PathError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(PathError::Empty);
        }
        let malformed = |reason: &str| PathError::Malformed {
            path: trimmed.to_string(),
            reason: reason.to_string(),
        };

        let mut segments = Vec::new();
        let mut key = String::new();
        let mut chars = trimmed.chars().peekable();
        // True right after `]`, where a key may not follow without a dot.
        let mut after_index = false;

        while let Some(c) = chars.next() {
            match c {
                '.' => {
                    if key.is_empty() && !after_index {
                        return Err(malformed("empty key"));
                    }
                    if !key.is_empty() {
                        segments.push(Segment::Key(std::mem::take(&mut key)));
                    }
                    after_index = false;
                    if chars.peek().is_none() {
                        return Err(malformed("trailing '.'"));
                    }
                }
                '[' => {
                    if !key.is_empty() {
                        segments.push(Segment::Key(std::mem::take(&mut key)));
                    } else if segments.is_empty() {
                        return Err(malformed("index without a key"));
                    }
                    let mut digits = String::new();
                    loop {
                        match chars.next() {
                            Some(']') => break,
                            Some(d) if d.is_ascii_digit() => digits.push(d),
                            Some(_) => return Err(malformed("index must be a non-negative integer")),
                            None => return Err(malformed("unclosed '['")),
                        }
                    }
                    let index = digits
                        .parse::<usize>()
                        .map_err(|_| malformed("empty index"))?;
                    segments.push(Segment::Index(index));
                    after_index = true;
                }
                ']' => return Err(malformed("unexpected ']'")),
                other => {
                    if after_index {
                        return Err(malformed("expected '.' or '[' after index"));
                    }
                    key.push(other);
                }
            }
        }
        if !key.is_empty() {
            segments.push(Segment::Key(key));
        }

        Ok(Self {
            raw: trimmed.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Look the path up in `root`.
    pub fn resolve<'v>(&self, root: &'v Value) -> Result<&'v Value, PathError> {
        let mut current = root;
        for (i, segment) in self.segments.iter().enumerate() {
            current = match (segment, current) {
                (Segment::Key(k), Value::Object(map)) => map
                    .get(k)
                    .ok_or_else(|| PathError::Missing(self.prefix(i + 1)))?,
                (Segment::Key(k), Value::Array(items)) => {
                    let index = k.parse::<usize>().map_err(|_| PathError::TypeMismatch {
                        at: self.prefix(i + 1),
                        found: "array",
                    })?;
                    items
                        .get(index)
                        .ok_or_else(|| PathError::Missing(self.prefix(i + 1)))?
                }
                (Segment::Index(n), Value::Array(items)) => items
                    .get(*n)
                    .ok_or_else(|| PathError::Missing(self.prefix(i + 1)))?,
                (_, other) => {
                    return Err(PathError::TypeMismatch {
                        at: self.prefix(i + 1),
                        found: type_name(other),
                    })
                }
            };
        }
        Ok(current)
    }

    /// Write `value` at the path, creating intermediate objects. Arrays are
    /// only indexed (or appended at `len`), never padded.
    pub fn set(&self, root: &mut Value, value: Value) -> Result<(), PathError> {
        let Some((last, parents)) = self.segments.split_last() else {
            return Err(PathError::Empty);
        };

        let mut current = root;
        for (i, segment) in parents.iter().enumerate() {
            if current.is_null() {
                *current = Value::Object(Map::new());
            }
            current = match (segment, current) {
                (Segment::Key(k), Value::Object(map)) => {
                    map.entry(k.clone()).or_insert(Value::Null)
                }
                (Segment::Index(n), Value::Array(items)) => {
                    let len = items.len();
                    items.get_mut(*n).ok_or_else(|| PathError::Missing(format!(
                        "{} (array length {})",
                        self.prefix(i + 1),
                        len
                    )))?
                }
                (_, other) => {
                    return Err(PathError::TypeMismatch {
                        at: self.prefix(i + 1),
                        found: type_name(other),
                    })
                }
            };
        }

        if current.is_null() {
            *current = Value::Object(Map::new());
        }
        match (last, current) {
            (Segment::Key(k), Value::Object(map)) => {
                map.insert(k.clone(), value);
                Ok(())
            }
            (Segment::Index(n), Value::Array(items)) if *n < items.len() => {
                items[*n] = value;
                Ok(())
            }
            (Segment::Index(n), Value::Array(items)) if *n == items.len() => {
                items.push(value);
                Ok(())
            }
            (Segment::Index(_), Value::Array(_)) => Err(PathError::Missing(self.raw.clone())),
            (_, other) => Err(PathError::TypeMismatch {
                at: self.raw.clone(),
                found: type_name(other),
            }),
        }
    }

    /// Textual form of the first `n` segments, for error messages.
    fn prefix(&self, n: usize) -> String {
        let mut out = String::new();
        for segment in self.segments.iter().take(n) {
            match segment {
                Segment::Key(k) => {
                    if !out.is_empty() {
                        out.push('.');
                    }
                    out.push_str(k);
                }
                Segment::Index(i) => out.push_str(&format!("[{}]", i)),
            }
        }
        out
    }
}

/// Parse and resolve in one go.
pub fn resolve<'v>(root: &'v Value, path: &str) -> Result<&'v Value, PathError> {
    Path::parse(path)?.resolve(root)
}

pub(crate) fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_segments() {
        let path = Path::parse("messages[1].content").unwrap();
        assert_eq!(
            path.segments(),
            &[
                Segment::Key("messages".to_string()),
                Segment::Index(1),
                Segment::Key("content".to_string()),
            ]
        );
        assert!(Path::parse("Research Agent_result").is_ok());
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for bad in ["", "a..b", "a.", ".a", "a[x]", "a[1", "a]", "[0]", "a[0]b"] {
            assert!(Path::parse(bad).is_err(), "expected '{}' to be rejected", bad);
        }
    }

    #[test]
    fn test_resolve() {
        let tree = json!({
            "previous_output": { "content": "Paris", "messages": [{ "content": "m0" }] },
            "scores": [3, 5]
        });
        assert_eq!(resolve(&tree, "previous_output.content").unwrap(), "Paris");
        assert_eq!(resolve(&tree, "previous_output.messages[0].content").unwrap(), "m0");
        assert_eq!(resolve(&tree, "scores.1").unwrap(), 5);
        assert_eq!(
            resolve(&tree, "previous_output.missing"),
            Err(PathError::Missing("previous_output.missing".to_string()))
        );
        assert!(matches!(
            resolve(&tree, "previous_output.content.length"),
            Err(PathError::TypeMismatch { found: "string", .. })
        ));
    }

    #[test]
    fn test_set_creates_intermediate_objects() {
        let mut root = Value::Null;
        Path::parse("retry.max").unwrap().set(&mut root, json!(3)).unwrap();
        assert_eq!(root, json!({ "retry": { "max": 3 } }));

        let mut list = json!({ "items": [1] });
        Path::parse("items[1]").unwrap().set(&mut list, json!(2)).unwrap();
        assert_eq!(list, json!({ "items": [1, 2] }));
        assert!(Path::parse("items[5]").unwrap().set(&mut list, json!(9)).is_err());
    }
}
