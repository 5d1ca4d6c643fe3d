/// LiveGrid Cell Values
///
/// A `CellValue` is the primitive stored in a single grid cell and the type of
/// every row key. Grid cells hold scalars only, so JSON containers collapse to
/// `Empty` when converted.
///
/// # JSON Pointer Leaves
///
/// Structured topic values are projected onto columns by JSON pointer
/// (`/a/b`). `leaf_pointers` decomposes a value into its scalar leaves, e.g.
/// `{"a": {"b": 1, "c": 2}}` becomes `{"/a/b": 1, "/a/c": 2}`.

use indexmap::IndexMap;
use serde_json::Value as JsonValue;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Cell value enum to support the primitive types a grid can display
#[derive(Debug, Clone, Default)]
pub enum CellValue {
    #[default]
    Empty,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl CellValue {
    pub fn is_empty(&self) -> bool {
        matches!(self, CellValue::Empty)
    }

    /// Numeric view of the cell; integers widen to `f64`.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            CellValue::Float(v) => Some(*v),
            CellValue::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    /// Convert a JSON value into a cell. Objects and arrays are not primitives
    /// and become `Empty`.
    pub fn from_json(value: &JsonValue) -> CellValue {
        match value {
            JsonValue::Null => CellValue::Empty,
            JsonValue::Bool(b) => CellValue::Bool(*b),
            JsonValue::Number(n) => {
                if let Some(i) = n.as_i64() {
                    CellValue::Int(i)
                } else if let Some(f) = n.as_f64() {
                    CellValue::Float(f)
                } else {
                    CellValue::Empty
                }
            }
            JsonValue::String(s) => CellValue::Text(s.clone()),
            JsonValue::Array(_) | JsonValue::Object(_) => CellValue::Empty,
        }
    }
}

// Floats compare by bit pattern so a cell can key a hash map.
impl PartialEq for CellValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (CellValue::Empty, CellValue::Empty) => true,
            (CellValue::Bool(a), CellValue::Bool(b)) => a == b,
            (CellValue::Int(a), CellValue::Int(b)) => a == b,
            (CellValue::Float(a), CellValue::Float(b)) => a.to_bits() == b.to_bits(),
            (CellValue::Text(a), CellValue::Text(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for CellValue {}

impl Hash for CellValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            CellValue::Empty => {}
            CellValue::Bool(v) => v.hash(state),
            CellValue::Int(v) => v.hash(state),
            CellValue::Float(v) => v.to_bits().hash(state),
            CellValue::Text(v) => v.hash(state),
        }
    }
}

impl fmt::Display for CellValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CellValue::Empty => Ok(()),
            CellValue::Bool(v) => write!(f, "{}", v),
            CellValue::Int(v) => write!(f, "{}", v),
            CellValue::Float(v) => write!(f, "{}", v),
            CellValue::Text(v) => f.write_str(v),
        }
    }
}

impl From<&str> for CellValue {
    fn from(value: &str) -> Self {
        CellValue::Text(value.to_string())
    }
}

impl From<String> for CellValue {
    fn from(value: String) -> Self {
        CellValue::Text(value)
    }
}

impl From<i64> for CellValue {
    fn from(value: i64) -> Self {
        CellValue::Int(value)
    }
}

impl From<f64> for CellValue {
    fn from(value: f64) -> Self {
        CellValue::Float(value)
    }
}

impl From<bool> for CellValue {
    fn from(value: bool) -> Self {
        CellValue::Bool(value)
    }
}

/// Decompose a JSON value into its scalar leaves keyed by JSON pointer.
///
/// Traversal is depth first. Objects and arrays are never leaves; an empty
/// container therefore contributes nothing. A scalar root yields the pointer `""`.
pub fn leaf_pointers(value: &JsonValue) -> IndexMap<String, CellValue> {
    let mut result = IndexMap::new();
    let mut pointer = String::new();
    visit(value, &mut pointer, &mut result);
    result
}

fn visit(value: &JsonValue, pointer: &mut String, result: &mut IndexMap<String, CellValue>) {
    match value {
        JsonValue::Object(map) => {
            for (name, child) in map {
                let mark = pointer.len();
                pointer.push('/');
                push_escaped(pointer, name);
                visit(child, pointer, result);
                pointer.truncate(mark);
            }
        }
        JsonValue::Array(items) => {
            for (i, child) in items.iter().enumerate() {
                let mark = pointer.len();
                pointer.push('/');
                pointer.push_str(&i.to_string());
                visit(child, pointer, result);
                pointer.truncate(mark);
            }
        }
        scalar => {
            result.insert(pointer.clone(), CellValue::from_json(scalar));
        }
    }
}

/// RFC 6901 escaping of a single reference token.
fn push_escaped(pointer: &mut String, token: &str) {
    for c in token.chars() {
        match c {
            '~' => pointer.push_str("~0"),
            '/' => pointer.push_str("~1"),
            c => pointer.push(c),
        }
    }
}

/// Resolve a JSON pointer against a value, yielding `Empty` when the path is
/// absent or lands on a container.
pub fn lookup(value: &JsonValue, pointer: &str) -> CellValue {
    value
        .pointer(pointer)
        .map(CellValue::from_json)
        .unwrap_or(CellValue::Empty)
}
