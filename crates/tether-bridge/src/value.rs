//! Host-side values the sandboxed module refers to by handle.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::closure::HostClosure;

/// A value living on the host side of the bridge.
///
/// Cloning is cheap: strings, arrays, documents and resources are shared
/// behind `Arc`, so two handles produced by `object_clone_ref` observe the
/// same underlying object.
#[derive(Clone)]
pub enum HostValue {
    /// The `undefined` sentinel
    Undefined,
    /// The `null` sentinel
    Null,
    /// Boolean
    Bool(bool),
    /// Number (all numbers cross as `f64`)
    Number(f64),
    /// Immutable string
    String(Arc<str>),
    /// Copy of a typed range of module memory
    Array(TypedArray),
    /// Structured document (objects and arrays)
    Json(Arc<serde_json::Value>),
    /// Arbitrary embedder object
    Resource(HostResource),
    /// Callable wrapper around a sandboxed closure
    Function(HostClosure),
    /// Exception value
    Error(HostError),
}

/// Typed array snapshot copied out of module memory.
#[derive(Clone, Debug, PartialEq)]
pub enum TypedArray {
    /// Plain bytes
    Bytes(Arc<[u8]>),
    /// Bytes with saturating write semantics
    Clamped(Arc<[u8]>),
    /// 32-bit unsigned words
    U32(Arc<[u32]>),
    /// 32-bit floats
    F32(Arc<[f32]>),
}

impl TypedArray {
    /// Element count
    pub fn len(&self) -> usize {
        match self {
            TypedArray::Bytes(v) | TypedArray::Clamped(v) => v.len(),
            TypedArray::U32(v) => v.len(),
            TypedArray::F32(v) => v.len(),
        }
    }

    /// True if the array has no elements
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Constructor name used in debug output
    pub fn kind(&self) -> &'static str {
        match self {
            TypedArray::Bytes(_) => "Uint8Array",
            TypedArray::Clamped(_) => "Uint8ClampedArray",
            TypedArray::U32(_) => "Uint32Array",
            TypedArray::F32(_) => "Float32Array",
        }
    }

    /// Elements widened to `f64`, for serialization.
    pub fn to_f64_vec(&self) -> Vec<f64> {
        match self {
            TypedArray::Bytes(v) | TypedArray::Clamped(v) => v.iter().map(|&b| b as f64).collect(),
            TypedArray::U32(v) => v.iter().map(|&w| w as f64).collect(),
            TypedArray::F32(v) => v.iter().map(|&f| f as f64).collect(),
        }
    }
}

/// Exception raised by a host operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostError {
    /// Error class, e.g. `TypeError`
    pub name: String,
    /// Human readable message
    pub message: String,
}

impl HostError {
    /// Create an error with a class name and message.
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }

    /// `TypeError` shorthand
    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new("TypeError", message)
    }
}

impl fmt::Display for HostError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

/// Opaque embedder object, shared by reference.
#[derive(Clone)]
pub struct HostResource {
    type_name: &'static str,
    inner: Arc<dyn Any + Send + Sync>,
}

impl HostResource {
    /// Wrap any `'static` value.
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self {
            type_name: std::any::type_name::<T>(),
            inner: Arc::new(value),
        }
    }

    /// Borrow the wrapped value if it has type `T`.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.inner.downcast_ref::<T>()
    }

    /// Rust type name of the wrapped value
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// True if both resources share the same allocation.
    pub fn ptr_eq(&self, other: &HostResource) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl HostValue {
    /// Build a string value.
    pub fn string(s: impl AsRef<str>) -> Self {
        HostValue::String(Arc::from(s.as_ref()))
    }

    /// Build an error value.
    pub fn error(name: impl Into<String>, message: impl Into<String>) -> Self {
        HostValue::Error(HostError::new(name, message))
    }

    /// Wrap an embedder object.
    pub fn resource<T: Any + Send + Sync>(value: T) -> Self {
        HostValue::Resource(HostResource::new(value))
    }

    /// `undefined` or `null`
    pub fn is_like_none(&self) -> bool {
        matches!(self, HostValue::Undefined | HostValue::Null)
    }

    /// Reference-like values: everything that is not a primitive.
    pub fn is_object(&self) -> bool {
        matches!(
            self,
            HostValue::Array(_)
                | HostValue::Json(_)
                | HostValue::Resource(_)
                | HostValue::Error(_)
        )
    }

    /// Type name for diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            HostValue::Undefined => "undefined",
            HostValue::Null => "null",
            HostValue::Bool(_) => "boolean",
            HostValue::Number(_) => "number",
            HostValue::String(_) => "string",
            HostValue::Array(_) => "typed array",
            HostValue::Json(_) => "object",
            HostValue::Resource(_) => "resource",
            HostValue::Function(_) => "function",
            HostValue::Error(_) => "error",
        }
    }

    /// String contents, if this is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            HostValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Numeric value, if this is a number.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            HostValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Boolean value, if this is a boolean.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            HostValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Closure wrapper, if this is a function.
    pub fn as_closure(&self) -> Option<&HostClosure> {
        match self {
            HostValue::Function(c) => Some(c),
            _ => None,
        }
    }

    /// Human readable rendering used by the `debug_string` import.
    pub fn debug_string(&self) -> String {
        match self {
            HostValue::Undefined => "undefined".to_string(),
            HostValue::Null => "null".to_string(),
            HostValue::Bool(b) => b.to_string(),
            HostValue::Number(n) => format_number(*n),
            HostValue::String(s) => format!("\"{}\"", s),
            HostValue::Array(a) => format!("{}({})", a.kind(), a.len()),
            HostValue::Json(v) => match v.as_ref() {
                serde_json::Value::Array(items) => {
                    let inner: Vec<String> = items
                        .iter()
                        .map(|item| HostValue::from(item.clone()).debug_string())
                        .collect();
                    format!("[{}]", inner.join(", "))
                }
                other => format!("Object({})", other),
            },
            HostValue::Resource(r) => format!("Resource({})", r.type_name()),
            HostValue::Function(_) => "Function".to_string(),
            HostValue::Error(e) => e.to_string(),
        }
    }

    /// Serialize to JSON text. Values with no JSON form yield `None`.
    pub fn to_json(&self) -> Option<serde_json::Value> {
        use serde_json::Value;
        match self {
            HostValue::Null => Some(Value::Null),
            HostValue::Bool(b) => Some(Value::Bool(*b)),
            HostValue::Number(n) => Some(json_number(*n)),
            HostValue::String(s) => Some(Value::String(s.to_string())),
            HostValue::Array(a) => Some(Value::Array(
                a.to_f64_vec().into_iter().map(json_number).collect(),
            )),
            HostValue::Json(v) => Some(v.as_ref().clone()),
            HostValue::Error(_) => Some(Value::Object(serde_json::Map::new())),
            HostValue::Undefined | HostValue::Resource(_) | HostValue::Function(_) => None,
        }
    }
}

/// Largest integer an `f64` holds exactly.
const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_991.0;

/// Integral numbers serialize without a fraction; NaN and infinities as null.
fn json_number(n: f64) -> serde_json::Value {
    if n.fract() == 0.0 && n.abs() <= MAX_SAFE_INTEGER {
        serde_json::Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null)
    }
}

/// Console rendering: integral values print without a fraction.
fn format_number(n: f64) -> String {
    if n.is_infinite() {
        let sign = if n < 0.0 { "-" } else { "" };
        format!("{}Infinity", sign)
    } else {
        n.to_string()
    }
}

impl fmt::Debug for HostValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.debug_string())
    }
}

impl PartialEq for HostValue {
    /// Primitives compare by value, reference types by identity.
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (HostValue::Undefined, HostValue::Undefined) => true,
            (HostValue::Null, HostValue::Null) => true,
            (HostValue::Bool(a), HostValue::Bool(b)) => a == b,
            (HostValue::Number(a), HostValue::Number(b)) => a == b,
            (HostValue::String(a), HostValue::String(b)) => a == b,
            (HostValue::Array(a), HostValue::Array(b)) => a == b,
            (HostValue::Json(a), HostValue::Json(b)) => Arc::ptr_eq(a, b),
            (HostValue::Resource(a), HostValue::Resource(b)) => a.ptr_eq(b),
            (HostValue::Function(a), HostValue::Function(b)) => a.ptr_eq(b),
            (HostValue::Error(a), HostValue::Error(b)) => a == b,
            _ => false,
        }
    }
}

impl From<bool> for HostValue {
    fn from(b: bool) -> Self {
        HostValue::Bool(b)
    }
}

impl From<f64> for HostValue {
    fn from(n: f64) -> Self {
        HostValue::Number(n)
    }
}

impl From<&str> for HostValue {
    fn from(s: &str) -> Self {
        HostValue::string(s)
    }
}

impl From<String> for HostValue {
    fn from(s: String) -> Self {
        HostValue::String(Arc::from(s))
    }
}

impl From<HostError> for HostValue {
    fn from(e: HostError) -> Self {
        HostValue::Error(e)
    }
}

impl From<serde_json::Value> for HostValue {
    /// JSON primitives become host primitives; objects and arrays stay documents.
    fn from(v: serde_json::Value) -> Self {
        use serde_json::Value;
        match v {
            Value::Null => HostValue::Null,
            Value::Bool(b) => HostValue::Bool(b),
            Value::Number(n) => HostValue::Number(n.as_f64().unwrap_or(f64::NAN)),
            Value::String(s) => HostValue::from(s),
            doc @ (Value::Array(_) | Value::Object(_)) => HostValue::Json(Arc::new(doc)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_string_primitives() {
        assert_eq!(HostValue::Undefined.debug_string(), "undefined");
        assert_eq!(HostValue::Number(3.0).debug_string(), "3");
        assert_eq!(HostValue::Number(1.5).debug_string(), "1.5");
        assert_eq!(HostValue::string("hi").debug_string(), "\"hi\"");
        assert_eq!(
            HostValue::error("TypeError", "nope").debug_string(),
            "TypeError: nope"
        );
    }

    #[test]
    fn test_json_conversion() {
        let v: serde_json::Value = serde_json::json!({"a": [1, 2]});
        let host = HostValue::from(v.clone());
        assert!(host.is_object());
        assert_eq!(host.to_json(), Some(v));

        assert_eq!(HostValue::from(serde_json::json!("x")), HostValue::string("x"));
        assert_eq!(HostValue::from(serde_json::Value::Null), HostValue::Null);
        assert!(HostValue::Undefined.to_json().is_none());
    }

    #[test]
    fn test_json_numbers() {
        let text = |v: HostValue| v.to_json().unwrap().to_string();
        assert_eq!(text(HostValue::Number(21.0)), "21");
        assert_eq!(text(HostValue::Number(-0.0)), "0");
        assert_eq!(text(HostValue::Number(1.5)), "1.5");
        assert_eq!(text(HostValue::Number(f64::NAN)), "null");
        assert_eq!(
            text(HostValue::Array(TypedArray::F32(vec![1.0, 0.5].into()))),
            "[1,0.5]"
        );
    }

    #[test]
    fn test_resource_identity() {
        let a = HostValue::resource(42u32);
        let b = a.clone();
        let c = HostValue::resource(42u32);
        assert_eq!(a, b);
        assert_ne!(a, c);

        if let HostValue::Resource(r) = &a {
            assert_eq!(r.downcast_ref::<u32>(), Some(&42));
            assert!(r.downcast_ref::<i64>().is_none());
        } else {
            panic!("expected resource");
        }
    }
}
