use std::fmt;
use std::sync::Arc;

use crate::node::NodeId;

/// A field value. Cheap to clone; text is shared.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Unit,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(Arc<str>),
    /// Reference to a scene-graph node, or empty.
    NodeRef(Option<NodeId>),
    List(Vec<Value>),
}

/// Value type of a field, checked when routes are created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeTag {
    /// Accepts routes of any value type (sinks, caches).
    Any,
    Unit,
    Bool,
    Int,
    Float,
    Text,
    NodeRef,
    List,
}

impl TypeTag {
    /// Whether a field of this type accepts an incoming route
    /// from a field of type `from`.
    pub fn accepts(self, from: TypeTag) -> bool {
        self == TypeTag::Any || self == from
    }

    /// An initial value for a field of this type.
    pub fn default_value(self) -> Value {
        match self {
            TypeTag::Any | TypeTag::Unit => Value::Unit,
            TypeTag::Bool => Value::Bool(false),
            TypeTag::Int => Value::Int(0),
            TypeTag::Float => Value::Float(0.0),
            TypeTag::Text => Value::Text("".into()),
            TypeTag::NodeRef => Value::NodeRef(None),
            TypeTag::List => Value::List(Vec::new()),
        }
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TypeTag::Any => "Any",
            TypeTag::Unit => "Unit",
            TypeTag::Bool => "Bool",
            TypeTag::Int => "Int",
            TypeTag::Float => "Float",
            TypeTag::Text => "Text",
            TypeTag::NodeRef => "NodeRef",
            TypeTag::List => "List",
        };
        f.write_str(name)
    }
}

impl Value {
    pub fn tag(&self) -> TypeTag {
        match self {
            Value::Unit => TypeTag::Unit,
            Value::Bool(_) => TypeTag::Bool,
            Value::Int(_) => TypeTag::Int,
            Value::Float(_) => TypeTag::Float,
            Value::Text(_) => TypeTag::Text,
            Value::NodeRef(_) => TypeTag::NodeRef,
            Value::List(_) => TypeTag::List,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(n) => Some(*n),
            Value::Int(n) => Some(*n as f64),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_node(&self) -> Option<NodeId> {
        match self {
            Value::NodeRef(n) => *n,
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Unit => f.write_str("()"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(n) => write!(f, "{n}"),
            Value::Float(n) => write!(f, "{n}"),
            Value::Text(s) => write!(f, "{s:?}"),
            Value::NodeRef(Some(n)) => write!(f, "node:{n}"),
            Value::NodeRef(None) => f.write_str("node:-"),
            Value::List(items) => {
                f.write_str("[")?;
                for (i, v) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{v}")?;
                }
                f.write_str("]")
            }
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Float(n)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.into())
    }
}
