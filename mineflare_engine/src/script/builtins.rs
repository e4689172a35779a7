//! Pure builtin functions
//!
//! The fixed library available to every program: arithmetic, comparison,
//! collection helpers, string building, result constructors and the
//! restricted `math.*` namespace. Nothing here touches the wall clock, the
//! OS random source, or any other ambient authority.

use std::collections::BTreeMap;

use super::{
    env::Env,
    value::{self, Interrupt, Value, fail_value, ok_value, result_ok},
};
use mineflare_core::error::ErrorKind;

pub fn install(env: &Env) {
    install_arithmetic(env);
    install_comparison(env);
    install_collections(env);
    install_results(env);
    install_math(env);
}

fn nums(args: &[Value], op: &str) -> Result<Vec<f64>, Interrupt> {
    args.iter()
        .map(|v| match v {
            Value::Num(n) => Ok(*n),
            other => Err(Interrupt::invalid_argument(format!(
                "{op} expects numbers, got {}",
                other.type_name()
            ))),
        })
        .collect()
}

fn install_arithmetic(env: &Env) {
    env.define(
        "+",
        Value::native_pure("+", |args| {
            Ok(Value::Num(nums(&args, "+")?.iter().sum()))
        }),
    );
    env.define(
        "-",
        Value::native_pure("-", |args| {
            let ns = nums(&args, "-")?;
            match ns.split_first() {
                None => Err(Interrupt::invalid_argument("- expects at least one number")),
                Some((first, [])) => Ok(Value::Num(-first)),
                Some((first, rest)) => Ok(Value::Num(rest.iter().fold(*first, |acc, n| acc - n))),
            }
        }),
    );
    env.define(
        "*",
        Value::native_pure("*", |args| {
            Ok(Value::Num(nums(&args, "*")?.iter().product()))
        }),
    );
    env.define(
        "/",
        Value::native_pure("/", |args| {
            let ns = nums(&args, "/")?;
            match ns.split_first() {
                Some((first, rest)) if !rest.is_empty() => {
                    Ok(Value::Num(rest.iter().fold(*first, |acc, n| acc / n)))
                }
                _ => Err(Interrupt::invalid_argument("/ expects at least two numbers")),
            }
        }),
    );
    env.define(
        "mod",
        Value::native_pure("mod", |args| {
            let ns = nums(&args, "mod")?;
            let [a, b] = ns[..] else {
                return Err(Interrupt::invalid_argument("mod expects two numbers"));
            };
            Ok(Value::Num(a.rem_euclid(b)))
        }),
    );
}

fn chain(args: &[Value], op: &str, cmp: fn(f64, f64) -> bool) -> Result<Value, Interrupt> {
    let ns = nums(args, op)?;
    if ns.len() < 2 {
        return Err(Interrupt::invalid_argument(format!(
            "{op} expects at least two numbers"
        )));
    }
    Ok(Value::Bool(ns.windows(2).all(|w| cmp(w[0], w[1]))))
}

fn install_comparison(env: &Env) {
    env.define(
        "=",
        Value::native_pure("=", |args| {
            Ok(Value::Bool(args.windows(2).all(|w| w[0] == w[1])))
        }),
    );
    env.define(
        "not=",
        Value::native_pure("not=", |args| {
            Ok(Value::Bool(!args.windows(2).all(|w| w[0] == w[1])))
        }),
    );
    env.define("<", Value::native_pure("<", |args| chain(&args, "<", |a, b| a < b)));
    env.define("<=", Value::native_pure("<=", |args| chain(&args, "<=", |a, b| a <= b)));
    env.define(">", Value::native_pure(">", |args| chain(&args, ">", |a, b| a > b)));
    env.define(">=", Value::native_pure(">=", |args| chain(&args, ">=", |a, b| a >= b)));
    env.define(
        "not",
        Value::native_pure("not", |args| {
            Ok(Value::Bool(!args.first().is_some_and(Value::truthy)))
        }),
    );
}

fn lookup(collection: &Value, key: &Value, default: Option<Value>) -> Value {
    let found = match (collection, key) {
        (Value::Map(map), key) => key.as_key().and_then(|k| map.get(k).cloned()),
        (Value::Vector(items), Value::Num(i)) if *i >= 0.0 => items.get(*i as usize).cloned(),
        _ => None,
    };
    found.unwrap_or(default.unwrap_or(Value::Nil))
}

fn install_collections(env: &Env) {
    env.define(
        "list",
        Value::native_pure("list", |args| Ok(Value::vector(args))),
    );
    env.define(
        "get",
        Value::native_pure("get", |args| {
            let collection = value::arg(&args, 0, "collection")?;
            let key = value::arg(&args, 1, "key")?;
            Ok(lookup(&collection, &key, value::opt_arg(&args, 2)))
        }),
    );
    env.define(
        "nth",
        Value::native_pure("nth", |args| {
            let items = value::vector_arg(&args, 0, "vector")?;
            let idx = value::num_arg(&args, 1, "index")?;
            let found = (idx >= 0.0)
                .then(|| items.get(idx as usize).cloned())
                .flatten();
            Ok(found.unwrap_or(value::opt_arg(&args, 2).unwrap_or(Value::Nil)))
        }),
    );
    env.define(
        "count",
        Value::native_pure("count", |args| {
            let n = match value::arg(&args, 0, "collection")? {
                Value::Nil => 0,
                Value::Vector(items) => items.len(),
                Value::Map(map) => map.len(),
                Value::Str(s) => s.chars().count(),
                other => {
                    return Err(Interrupt::invalid_argument(format!(
                        "count expects a collection, got {}",
                        other.type_name()
                    )));
                }
            };
            Ok(Value::Num(n as f64))
        }),
    );
    env.define(
        "push",
        Value::native_pure("push", |args| {
            let items = value::vector_arg(&args, 0, "vector")?;
            let mut out = items.as_ref().clone();
            out.extend(args[1..].iter().cloned());
            Ok(Value::vector(out))
        }),
    );
    env.define(
        "put",
        Value::native_pure("put", |args| {
            let map = value::map_arg(&args, 0, "map")?;
            let key = value::arg(&args, 1, "key")?;
            let Some(key) = key.as_key().map(str::to_string) else {
                return Err(Interrupt::invalid_argument(
                    "put key must be a keyword or string",
                ));
            };
            let mut out = map.as_ref().clone();
            out.insert(key, value::arg(&args, 2, "value")?);
            Ok(Value::map(out))
        }),
    );
    env.define(
        "first",
        Value::native_pure("first", |args| {
            let items = value::vector_arg(&args, 0, "vector")?;
            Ok(items.first().cloned().unwrap_or(Value::Nil))
        }),
    );
    env.define(
        "rest",
        Value::native_pure("rest", |args| {
            let items = value::vector_arg(&args, 0, "vector")?;
            Ok(Value::vector(items.iter().skip(1).cloned().collect()))
        }),
    );
    env.define(
        "contains?",
        Value::native_pure("contains?", |args| {
            let collection = value::arg(&args, 0, "collection")?;
            let key = value::arg(&args, 1, "key")?;
            let found = match &collection {
                Value::Map(map) => key.as_key().is_some_and(|k| map.contains_key(k)),
                Value::Vector(items) => items.contains(&key),
                Value::Str(s) => key.as_key().is_some_and(|sub| s.contains(sub)),
                _ => false,
            };
            Ok(Value::Bool(found))
        }),
    );
    env.define(
        "keys",
        Value::native_pure("keys", |args| {
            let map = value::map_arg(&args, 0, "map")?;
            Ok(Value::vector(map.keys().map(Value::keyword).collect()))
        }),
    );
    env.define(
        "vals",
        Value::native_pure("vals", |args| {
            let map = value::map_arg(&args, 0, "map")?;
            Ok(Value::vector(map.values().cloned().collect()))
        }),
    );
    env.define(
        "range",
        Value::native_pure("range", |args| {
            let (lo, hi) = match args.len() {
                1 => (0.0, value::num_arg(&args, 0, "end")?),
                _ => (
                    value::num_arg(&args, 0, "start")?,
                    value::num_arg(&args, 1, "end")?,
                ),
            };
            let mut out = Vec::new();
            let mut i = lo;
            while i < hi {
                out.push(Value::Num(i));
                i += 1.0;
            }
            Ok(Value::vector(out))
        }),
    );
    env.define(
        "str",
        Value::native_pure("str", |args| {
            let mut out = String::new();
            for arg in &args {
                match arg {
                    Value::Nil => {}
                    other => out.push_str(&other.to_string()),
                }
            }
            Ok(Value::string(out))
        }),
    );
    env.define(
        "map",
        Value::native("map", |interp, args| {
            Box::pin(async move {
                let f = value::callable_arg(&args, 0, "function")?;
                let items = value::vector_arg(&args, 1, "vector")?;
                let mut out = Vec::with_capacity(items.len());
                for item in items.iter() {
                    out.push(interp.apply(f.clone(), vec![item.clone()]).await?);
                }
                Ok(Value::vector(out))
            })
        }),
    );
    env.define(
        "filter",
        Value::native("filter", |interp, args| {
            Box::pin(async move {
                let f = value::callable_arg(&args, 0, "predicate")?;
                let items = value::vector_arg(&args, 1, "vector")?;
                let mut out = Vec::new();
                for item in items.iter() {
                    if interp.apply(f.clone(), vec![item.clone()]).await?.truthy() {
                        out.push(item.clone());
                    }
                }
                Ok(Value::vector(out))
            })
        }),
    );

    for (name, pred) in [
        ("nil?", (|v: &Value| matches!(v, Value::Nil)) as fn(&Value) -> bool),
        ("num?", |v| matches!(v, Value::Num(_))),
        ("str?", |v| matches!(v, Value::Str(_))),
        ("vec?", |v| matches!(v, Value::Vector(_))),
        ("map?", |v| matches!(v, Value::Map(_))),
        ("fn?", Value::is_callable),
    ] {
        env.define(
            name,
            Value::native_pure(name, move |args| {
                Ok(Value::Bool(args.first().is_some_and(pred)))
            }),
        );
    }
}

fn install_results(env: &Env) {
    env.define(
        "ok",
        Value::native_pure("ok", |args| {
            Ok(ok_value(args.into_iter().next().unwrap_or(Value::Nil)))
        }),
    );
    env.define(
        "fail",
        Value::native_pure("fail", |args| {
            // (fail {:kind .. :message ..}) wraps an existing error map;
            // (fail message detail?) builds an OPERATION_FAILED error.
            if let Some(Value::Map(map)) = args.first()
                && map.contains_key("kind")
            {
                let mut out = BTreeMap::new();
                out.insert("ok".to_string(), Value::Bool(false));
                out.insert("error".to_string(), Value::Map(map.clone()));
                return Ok(Value::map(out));
            }
            let message = value::str_arg(&args, 0, "message")?;
            Ok(fail_value(
                ErrorKind::OperationFailed,
                message,
                value::opt_arg(&args, 1),
            ))
        }),
    );
    env.define(
        "ok?",
        Value::native_pure("ok?", |args| {
            let v = value::arg(&args, 0, "result")?;
            Ok(Value::Bool(result_ok(&v) == Some(true)))
        }),
    );
}

fn install_math(env: &Env) {
    for (name, f) in [
        ("math.abs", f64::abs as fn(f64) -> f64),
        ("math.floor", f64::floor),
        ("math.ceil", f64::ceil),
        ("math.round", f64::round),
        ("math.sqrt", f64::sqrt),
    ] {
        env.define(
            name,
            Value::native_pure(name, move |args| {
                Ok(Value::Num(f(value::num_arg(&args, 0, "n")?)))
            }),
        );
    }
    for (name, f) in [
        ("math.pow", f64::powf as fn(f64, f64) -> f64),
        ("math.min", f64::min),
        ("math.max", f64::max),
    ] {
        env.define(
            name,
            Value::native_pure(name, move |args| {
                Ok(Value::Num(f(
                    value::num_arg(&args, 0, "a")?,
                    value::num_arg(&args, 1, "b")?,
                )))
            }),
        );
    }
    env.define("math.pi", Value::Num(std::f64::consts::PI));
}
