//! In-memory result tree.
//!
//! A [`ResultTree`] is an insertion-ordered mapping of string keys to [`Node`]s. A node is a
//! typed leaf [`Value`], a nested tree, or an explicit null (used for `fit_results` when
//! fitting was not requested). The reserved key [`ATTRS_KEY`] holds flat scalar metadata for
//! the enclosing level; storage backends map it onto group attributes.
//!
//! The canonical measurement shape is
//!
//! ```text
//! raw_images:  { image_0: <array>, image_1: <array>, ... }
//! fit_results: null | { image_0: { ...flattened fit... }, ... }
//! ```

use indexmap::IndexMap;
use ndarray::{Array, ArrayD, Dimension};
use serde::{Deserialize, Serialize};

/// Key holding the raw images of a measurement.
pub const RAW_IMAGES: &str = "raw_images";
/// Key holding the flattened fit results of a measurement.
pub const FIT_RESULTS: &str = "fit_results";
/// Reserved key for group-level metadata.
pub const ATTRS_KEY: &str = "attrs";

/// Positional key of a shot (`image_0`, `image_1`, ...).
pub fn shot_key(index: usize) -> String {
    format!("image_{index}")
}

/// N-dimensional array leaf with its element type preserved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ArrayValue {
    /// Unsigned 8-bit elements.
    U8(ArrayD<u8>),
    /// Unsigned 16-bit elements.
    U16(ArrayD<u16>),
    /// Unsigned 32-bit elements.
    U32(ArrayD<u32>),
    /// Signed 32-bit elements.
    I32(ArrayD<i32>),
    /// Signed 64-bit elements.
    I64(ArrayD<i64>),
    /// 32-bit float elements.
    F32(ArrayD<f32>),
    /// 64-bit float elements.
    F64(ArrayD<f64>),
}

impl ArrayValue {
    /// Shape of the array.
    pub fn shape(&self) -> &[usize] {
        match self {
            ArrayValue::U8(a) => a.shape(),
            ArrayValue::U16(a) => a.shape(),
            ArrayValue::U32(a) => a.shape(),
            ArrayValue::I32(a) => a.shape(),
            ArrayValue::I64(a) => a.shape(),
            ArrayValue::F32(a) => a.shape(),
            ArrayValue::F64(a) => a.shape(),
        }
    }

    /// Element type name.
    pub fn dtype(&self) -> &'static str {
        match self {
            ArrayValue::U8(_) => "u8",
            ArrayValue::U16(_) => "u16",
            ArrayValue::U32(_) => "u32",
            ArrayValue::I32(_) => "i32",
            ArrayValue::I64(_) => "i64",
            ArrayValue::F32(_) => "f32",
            ArrayValue::F64(_) => "f64",
        }
    }
}

/// Typed leaf value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// Boolean scalar.
    Bool(bool),
    /// Signed integer scalar.
    Int(i64),
    /// Unsigned integer scalar.
    UInt(u64),
    /// Float scalar.
    Float(f64),
    /// String scalar.
    Text(String),
    /// N-dimensional array.
    Array(ArrayValue),
}

impl Value {
    /// True for everything except arrays.
    pub fn is_scalar(&self) -> bool {
        !matches!(self, Value::Array(_))
    }

    /// Short type description, used in log and error messages.
    pub fn kind(&self) -> String {
        match self {
            Value::Bool(_) => "bool".into(),
            Value::Int(_) => "i64".into(),
            Value::UInt(_) => "u64".into(),
            Value::Float(_) => "f64".into(),
            Value::Text(_) => "string".into(),
            Value::Array(a) => format!("{}{:?}", a.dtype(), a.shape()),
        }
    }

    /// Returns the float payload, if this is a float scalar.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the array payload, if this is an array.
    pub fn as_array(&self) -> Option<&ArrayValue> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v.into())
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::UInt(v)
    }
}

impl From<usize> for Value {
    fn from(v: usize) -> Self {
        Value::UInt(v as u64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<ArrayValue> for Value {
    fn from(v: ArrayValue) -> Self {
        Value::Array(v)
    }
}

macro_rules! array_conversions {
    ($($elem:ty => $variant:ident),* $(,)?) => {
        $(
            impl<D: Dimension> From<Array<$elem, D>> for ArrayValue {
                fn from(a: Array<$elem, D>) -> Self {
                    ArrayValue::$variant(a.into_dyn())
                }
            }

            impl<D: Dimension> From<Array<$elem, D>> for Value {
                fn from(a: Array<$elem, D>) -> Self {
                    Value::Array(a.into())
                }
            }

            impl<D: Dimension> From<Array<$elem, D>> for Node {
                fn from(a: Array<$elem, D>) -> Self {
                    Node::Value(a.into())
                }
            }
        )*
    };
}

array_conversions!(
    u8 => U8,
    u16 => U16,
    u32 => U32,
    i32 => I32,
    i64 => I64,
    f32 => F32,
    f64 => F64,
);

/// One entry of a [`ResultTree`].
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    /// Leaf value.
    Value(Value),
    /// Nested mapping.
    Group(ResultTree),
    /// Explicit absence (e.g. `fit_results` when fitting was disabled).
    Null,
}

impl Node {
    /// Returns the leaf value, if any.
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Node::Value(v) => Some(v),
            _ => None,
        }
    }

    /// Returns the nested tree, if any.
    pub fn as_group(&self) -> Option<&ResultTree> {
        match self {
            Node::Group(g) => Some(g),
            _ => None,
        }
    }

    /// True for [`Node::Null`].
    pub fn is_null(&self) -> bool {
        matches!(self, Node::Null)
    }
}

macro_rules! leaf_conversions {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for Node {
                fn from(v: $ty) -> Self {
                    Node::Value(v.into())
                }
            }
        )*
    };
}

leaf_conversions!(bool, i64, i32, u64, usize, f64, &str, String, ArrayValue);

impl From<Value> for Node {
    fn from(v: Value) -> Self {
        Node::Value(v)
    }
}

impl From<ResultTree> for Node {
    fn from(tree: ResultTree) -> Self {
        Node::Group(tree)
    }
}

impl From<Option<ResultTree>> for Node {
    fn from(tree: Option<ResultTree>) -> Self {
        tree.map_or(Node::Null, Node::Group)
    }
}

/// Insertion-ordered, string-keyed tree of results.
///
/// Equality compares key sets and values; use [`ResultTree::keys`] when ordering matters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultTree {
    entries: IndexMap<String, Node>,
}

impl ResultTree {
    /// Empty tree.
    pub fn new() -> Self {
        Self::default()
    }

    /// Canonical measurement tree: `raw_images` followed by `fit_results`.
    pub fn measurement(raw_images: ResultTree, fit_results: Option<ResultTree>) -> Self {
        let mut tree = Self::new();
        tree.insert(RAW_IMAGES, raw_images);
        tree.insert(FIT_RESULTS, fit_results);
        tree
    }

    /// Inserts or replaces `key`, keeping the original position of an existing key.
    pub fn insert(&mut self, key: impl Into<String>, node: impl Into<Node>) -> &mut Self {
        self.entries.insert(key.into(), node.into());
        self
    }

    /// Sets one metadata entry, creating the `attrs` group at the front if needed.
    pub fn set_attr(&mut self, key: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        if !matches!(self.entries.get(ATTRS_KEY), Some(Node::Group(_))) {
            self.entries
                .shift_insert(0, ATTRS_KEY.to_string(), Node::Group(ResultTree::new()));
        }
        if let Some(Node::Group(attrs)) = self.entries.get_mut(ATTRS_KEY) {
            attrs.insert(key, Node::Value(value.into()));
        }
        self
    }

    /// Metadata of this level, if present.
    pub fn attrs(&self) -> Option<&ResultTree> {
        self.entries.get(ATTRS_KEY).and_then(Node::as_group)
    }

    /// Entry for `key`.
    pub fn get(&self, key: &str) -> Option<&Node> {
        self.entries.get(key)
    }

    /// Leaf value for `key`.
    pub fn value(&self, key: &str) -> Option<&Value> {
        self.get(key).and_then(Node::as_value)
    }

    /// Nested tree for `key`.
    pub fn group(&self, key: &str) -> Option<&ResultTree> {
        self.get(key).and_then(Node::as_group)
    }

    /// Whether `key` is present.
    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Keys in insertion order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Node)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of entries, `attrs` included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the tree has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The `raw_images` branch.
    pub fn raw_images(&self) -> Option<&ResultTree> {
        self.group(RAW_IMAGES)
    }

    /// The `fit_results` branch; `None` when absent or null.
    pub fn fit_results(&self) -> Option<&ResultTree> {
        self.group(FIT_RESULTS)
    }
}

impl FromIterator<(String, Node)> for ResultTree {
    fn from_iter<I: IntoIterator<Item = (String, Node)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for ResultTree {
    type Item = (String, Node);
    type IntoIter = indexmap::map::IntoIter<String, Node>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}
