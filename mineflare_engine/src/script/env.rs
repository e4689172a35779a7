//! Lexical environments
//!
//! Environments form a parent chain; closures capture the environment they
//! were created in. Bindings are behind a mutex so suspended script code
//! (timer callbacks, parallel branches) can share them safely.

use parking_lot::Mutex;
use std::{collections::HashMap, sync::Arc};

use super::value::Value;

#[derive(Clone)]
pub struct Env {
    inner: Arc<EnvInner>,
}

struct EnvInner {
    vars: Mutex<HashMap<String, Value>>,
    parent: Option<Env>,
}

impl Env {
    pub fn root() -> Self {
        Self {
            inner: Arc::new(EnvInner {
                vars: Mutex::new(HashMap::new()),
                parent: None,
            }),
        }
    }

    pub fn child(&self) -> Self {
        Self {
            inner: Arc::new(EnvInner {
                vars: Mutex::new(HashMap::new()),
                parent: Some(self.clone()),
            }),
        }
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        let mut env = Some(self);
        while let Some(e) = env {
            if let Some(v) = e.inner.vars.lock().get(name) {
                return Some(v.clone());
            }
            env = e.inner.parent.as_ref();
        }
        None
    }

    /// Binds `name` in this scope, shadowing any outer binding.
    pub fn define(&self, name: impl Into<String>, value: Value) {
        self.inner.vars.lock().insert(name.into(), value);
    }

    /// Reassigns an existing binding, walking the parent chain.
    /// Returns false if the name is unbound.
    pub fn assign(&self, name: &str, value: Value) -> bool {
        let mut env = Some(self);
        while let Some(e) = env {
            let mut vars = e.inner.vars.lock();
            if let Some(slot) = vars.get_mut(name) {
                *slot = value;
                return true;
            }
            drop(vars);
            env = e.inner.parent.as_ref();
        }
        false
    }
}
