//! Runtime values for the script interpreter
//!
//! Values are cheap to clone (shared payloads behind `Arc`) and convert
//! losslessly to and from JSON, with the exception of functions which only
//! exist inside a sandbox. This module also fixes the result-map convention
//! used as the universal currency of the context surface:
//! `{:ok true :value v}` or `{:ok false :error {:kind k :message m}}`.

use std::{collections::BTreeMap, fmt, sync::Arc};

use futures::future::BoxFuture;
use mineflare_core::{
    Json,
    error::{ErrorKind, ProgramError},
    value::Position,
};

use super::interp::Interp;

/// Evaluation interrupts: a typed error, a terminal sentinel from
/// `control.success` / `control.fail`, or cancellation. Sentinels and
/// cancellation propagate untouched through every combinator; only
/// [`Interrupt::Error`] participates in retry and rollback logic.
#[derive(Debug, Clone)]
pub enum Interrupt {
    Error(ProgramError),
    Success(Json),
    Fail { message: String, detail: Option<Json> },
    Cancelled,
}

impl From<ProgramError> for Interrupt {
    fn from(err: ProgramError) -> Self {
        Interrupt::Error(err)
    }
}

impl Interrupt {
    pub fn runtime(message: impl Into<String>) -> Self {
        Interrupt::Error(ProgramError::runtime(message))
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Interrupt::Error(ProgramError::invalid_argument(message))
    }
}

pub type NativeFuture = BoxFuture<'static, Result<Value, Interrupt>>;

/// A host function callable from script code.
pub struct NativeFn {
    pub name: &'static str,
    #[allow(clippy::type_complexity)]
    pub call: Box<dyn Fn(Interp, Vec<Value>) -> NativeFuture + Send + Sync>,
}

/// A script closure: parameter names, body forms and captured environment.
pub struct Lambda {
    pub params: Vec<String>,
    pub body: Vec<super::parser::Expr>,
    pub env: super::env::Env,
}

#[derive(Clone)]
pub enum Value {
    Nil,
    Bool(bool),
    Num(f64),
    Str(Arc<str>),
    Keyword(Arc<str>),
    Vector(Arc<Vec<Value>>),
    Map(Arc<BTreeMap<String, Value>>),
    Func(Arc<Lambda>),
    Native(Arc<NativeFn>),
}

impl Value {
    pub fn string(s: impl AsRef<str>) -> Self {
        Value::Str(Arc::from(s.as_ref()))
    }

    pub fn keyword(s: impl AsRef<str>) -> Self {
        Value::Keyword(Arc::from(s.as_ref()))
    }

    pub fn vector(items: Vec<Value>) -> Self {
        Value::Vector(Arc::new(items))
    }

    pub fn map(entries: BTreeMap<String, Value>) -> Self {
        Value::Map(Arc::new(entries))
    }

    /// Wraps an async host function as a value.
    pub fn native<F>(name: &'static str, f: F) -> Self
    where
        F: Fn(Interp, Vec<Value>) -> NativeFuture + Send + Sync + 'static,
    {
        Value::Native(Arc::new(NativeFn {
            name,
            call: Box::new(f),
        }))
    }

    /// Wraps a synchronous pure host function as a value.
    pub fn native_pure<F>(name: &'static str, f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Result<Value, Interrupt> + Send + Sync + 'static,
    {
        Value::native(name, move |_interp, args| {
            let res = f(args);
            Box::pin(std::future::ready(res))
        })
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "bool",
            Value::Num(_) => "number",
            Value::Str(_) => "string",
            Value::Keyword(_) => "keyword",
            Value::Vector(_) => "vector",
            Value::Map(_) => "map",
            Value::Func(_) | Value::Native(_) => "function",
        }
    }

    /// Everything is truthy except `nil` and `false`.
    pub fn truthy(&self) -> bool {
        !matches!(self, Value::Nil | Value::Bool(false))
    }

    pub fn is_callable(&self) -> bool {
        matches!(self, Value::Func(_) | Value::Native(_))
    }

    /// A map key: keywords and strings index maps by their text.
    pub fn as_key(&self) -> Option<&str> {
        match self {
            Value::Str(s) | Value::Keyword(s) => Some(s),
            _ => None,
        }
    }

    pub fn to_json(&self) -> Json {
        match self {
            Value::Nil => Json::Null,
            Value::Bool(b) => Json::Bool(*b),
            Value::Num(n) => serde_json::Number::from_f64(*n)
                .map(Json::Number)
                .unwrap_or(Json::Null),
            Value::Str(s) | Value::Keyword(s) => Json::String(s.to_string()),
            Value::Vector(items) => Json::Array(items.iter().map(Value::to_json).collect()),
            Value::Map(entries) => Json::Object(
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
            // Functions do not serialize; they only exist inside a sandbox.
            Value::Func(_) | Value::Native(_) => Json::Null,
        }
    }

    pub fn from_json(json: &Json) -> Value {
        match json {
            Json::Null => Value::Nil,
            Json::Bool(b) => Value::Bool(*b),
            Json::Number(n) => Value::Num(n.as_f64().unwrap_or(f64::NAN)),
            Json::String(s) => Value::string(s),
            Json::Array(items) => Value::vector(items.iter().map(Value::from_json).collect()),
            Json::Object(map) => Value::map(
                map.iter()
                    .map(|(k, v)| (k.clone(), Value::from_json(v)))
                    .collect(),
            ),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Num(a), Value::Num(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Keyword(a), Value::Keyword(b)) => a == b,
            (Value::Vector(a), Value::Vector(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            (Value::Func(a), Value::Func(b)) => Arc::ptr_eq(a, b),
            (Value::Native(a), Value::Native(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => f.write_str("nil"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Num(n) => write!(f, "{n}"),
            Value::Str(s) => write!(f, "{s:?}"),
            Value::Keyword(k) => write!(f, ":{k}"),
            Value::Vector(items) => f.debug_list().entries(items.iter()).finish(),
            Value::Map(entries) => f.debug_map().entries(entries.iter()).finish(),
            Value::Func(lam) => write!(f, "#<fn/{}>", lam.params.len()),
            Value::Native(n) => write!(f, "#<native {}>", n.name),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Str(s) => f.write_str(s),
            other => write!(f, "{other:?}"),
        }
    }
}

// ---- result-map convention -------------------------------------------------

/// `{:ok true :value v}`
pub fn ok_value(value: Value) -> Value {
    let mut map = BTreeMap::new();
    map.insert("ok".to_string(), Value::Bool(true));
    map.insert("value".to_string(), value);
    Value::map(map)
}

/// `{:ok false :error {:kind k :message m :detail d}}`
pub fn fail_value(kind: ErrorKind, message: impl Into<String>, detail: Option<Value>) -> Value {
    let mut error = BTreeMap::new();
    error.insert("kind".to_string(), Value::string(kind.as_str()));
    error.insert("message".to_string(), Value::string(message.into()));
    if let Some(detail) = detail {
        error.insert("detail".to_string(), detail);
    }
    let mut map = BTreeMap::new();
    map.insert("ok".to_string(), Value::Bool(false));
    map.insert("error".to_string(), Value::map(error));
    Value::map(map)
}

pub fn error_value(err: &ProgramError) -> Value {
    fail_value(
        err.kind,
        err.message.clone(),
        err.detail.as_ref().map(Value::from_json),
    )
}

/// `Some(true)` for ok-maps, `Some(false)` for fail-maps, `None` otherwise.
pub fn result_ok(value: &Value) -> Option<bool> {
    if let Value::Map(map) = value
        && let Some(Value::Bool(ok)) = map.get("ok")
    {
        return Some(*ok);
    }
    None
}

/// The `:error` map of a fail-map, decoded back into a typed error.
pub fn result_error(value: &Value) -> Option<ProgramError> {
    let Value::Map(map) = value else {
        return None;
    };
    let Some(Value::Map(error)) = map.get("error") else {
        return None;
    };
    let kind = match error.get("kind") {
        Some(Value::Str(s)) => serde_json::from_value::<ErrorKind>(Json::String(s.to_string()))
            .unwrap_or(ErrorKind::OperationFailed),
        _ => ErrorKind::OperationFailed,
    };
    let message = match error.get("message") {
        Some(Value::Str(s)) => s.to_string(),
        _ => String::new(),
    };
    let mut err = ProgramError::new(kind, message);
    if let Some(detail) = error.get("detail") {
        err = err.with_detail(detail.to_json());
    }
    Some(err)
}

// ---- argument helpers for host functions -----------------------------------

pub fn arg(args: &[Value], idx: usize, name: &str) -> Result<Value, Interrupt> {
    args.get(idx)
        .cloned()
        .ok_or_else(|| Interrupt::invalid_argument(format!("missing argument {name}")))
}

pub fn opt_arg(args: &[Value], idx: usize) -> Option<Value> {
    match args.get(idx) {
        None | Some(Value::Nil) => None,
        Some(v) => Some(v.clone()),
    }
}

pub fn num_arg(args: &[Value], idx: usize, name: &str) -> Result<f64, Interrupt> {
    match arg(args, idx, name)? {
        Value::Num(n) => Ok(n),
        other => Err(Interrupt::invalid_argument(format!(
            "{name} must be a number, got {}",
            other.type_name()
        ))),
    }
}

pub fn str_arg(args: &[Value], idx: usize, name: &str) -> Result<String, Interrupt> {
    match arg(args, idx, name)? {
        Value::Str(s) | Value::Keyword(s) => Ok(s.to_string()),
        other => Err(Interrupt::invalid_argument(format!(
            "{name} must be a string, got {}",
            other.type_name()
        ))),
    }
}

pub fn map_arg(
    args: &[Value],
    idx: usize,
    name: &str,
) -> Result<Arc<BTreeMap<String, Value>>, Interrupt> {
    match arg(args, idx, name)? {
        Value::Map(map) => Ok(map),
        other => Err(Interrupt::invalid_argument(format!(
            "{name} must be a map, got {}",
            other.type_name()
        ))),
    }
}

pub fn vector_arg(args: &[Value], idx: usize, name: &str) -> Result<Arc<Vec<Value>>, Interrupt> {
    match arg(args, idx, name)? {
        Value::Vector(items) => Ok(items),
        other => Err(Interrupt::invalid_argument(format!(
            "{name} must be a vector, got {}",
            other.type_name()
        ))),
    }
}

pub fn callable_arg(args: &[Value], idx: usize, name: &str) -> Result<Value, Interrupt> {
    let value = arg(args, idx, name)?;
    if value.is_callable() {
        Ok(value)
    } else {
        Err(Interrupt::invalid_argument(format!(
            "{name} must be a function, got {}",
            value.type_name()
        )))
    }
}

/// Reads a position from a `{:x :y :z}` map or an `[x y z]` vector.
pub fn position_from(value: &Value) -> Result<Position, Interrupt> {
    match value {
        Value::Map(map) => {
            let component = |k: &str| match map.get(k) {
                Some(Value::Num(n)) => Ok(*n),
                _ => Err(Interrupt::invalid_argument(format!(
                    "position is missing numeric component {k}"
                ))),
            };
            let p = Position::new(component("x")?, component("y")?, component("z")?);
            if !p.is_finite() {
                return Err(Interrupt::invalid_argument("position must be finite"));
            }
            Ok(p)
        }
        Value::Vector(items) if items.len() == 3 => {
            let mut parts = [0.0f64; 3];
            for (i, item) in items.iter().enumerate() {
                match item {
                    Value::Num(n) => parts[i] = *n,
                    _ => {
                        return Err(Interrupt::invalid_argument(
                            "position vector components must be numbers",
                        ));
                    }
                }
            }
            Ok(Position::new(parts[0], parts[1], parts[2]))
        }
        other => Err(Interrupt::invalid_argument(format!(
            "expected a position, got {}",
            other.type_name()
        ))),
    }
}

pub fn position_value(p: &Position) -> Value {
    let mut map = BTreeMap::new();
    map.insert("x".to_string(), Value::Num(p.x));
    map.insert("y".to_string(), Value::Num(p.y));
    map.insert("z".to_string(), Value::Num(p.z));
    Value::map(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_roundtrip_preserves_data_values() {
        let json = serde_json::json!({
            "radius": 8.0,
            "deep": true,
            "name": "quarry",
            "corners": [[0.0, 64.0, 0.0], {"x": 1.0}],
        });
        let value = Value::from_json(&json);
        assert_eq!(value.to_json(), json);
    }

    #[test]
    fn result_maps_decode_back_to_errors() {
        let fail = fail_value(ErrorKind::Pathfind, "no path", None);
        assert_eq!(result_ok(&fail), Some(false));
        let err = result_error(&fail).unwrap();
        assert_eq!(err.kind, ErrorKind::Pathfind);
        assert_eq!(err.message, "no path");

        let ok = ok_value(Value::Num(1.0));
        assert_eq!(result_ok(&ok), Some(true));
        assert!(result_error(&ok).is_none());
        assert_eq!(result_ok(&Value::Nil), None);
    }

    #[test]
    fn positions_read_from_maps_and_vectors() {
        let from_map = position_from(&position_value(&Position::new(1.0, 64.0, -3.0))).unwrap();
        assert_eq!(from_map, Position::new(1.0, 64.0, -3.0));

        let from_vec = position_from(&Value::vector(vec![
            Value::Num(0.0),
            Value::Num(70.0),
            Value::Num(2.0),
        ]))
        .unwrap();
        assert_eq!(from_vec, Position::new(0.0, 70.0, 2.0));

        assert!(position_from(&Value::Num(1.0)).is_err());
    }

    #[test]
    fn truthiness() {
        assert!(!Value::Nil.truthy());
        assert!(!Value::Bool(false).truthy());
        assert!(Value::Num(0.0).truthy());
        assert!(Value::string("").truthy());
    }
}
