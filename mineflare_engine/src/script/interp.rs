//! Async tree-walking evaluator
//!
//! The interpreter gives programs a deterministic, single-logical-thread
//! view: evaluation only suspends inside host functions (action calls,
//! sleeps, timers). Special forms are fixed; everything else is function
//! application. Cancellation is checked at every application and loop
//! iteration so runaway scripts stop at the next step boundary.

use futures::future::BoxFuture;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::{
    env::Env,
    parser::Expr,
    value::{Interrupt, Lambda, Value},
};

#[derive(Clone)]
pub struct Interp {
    globals: Env,
    cancellation: CancellationToken,
}

impl Interp {
    pub fn new(globals: Env, cancellation: CancellationToken) -> Self {
        Self {
            globals,
            cancellation,
        }
    }

    pub fn globals(&self) -> &Env {
        &self.globals
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Evaluates a sequence of forms, returning the value of the last one.
    pub async fn eval_forms(&self, forms: &[Expr], env: &Env) -> Result<Value, Interrupt> {
        let mut last = Value::Nil;
        for form in forms {
            last = self.eval(form, env).await?;
        }
        Ok(last)
    }

    pub fn eval<'a>(
        &'a self,
        expr: &'a Expr,
        env: &'a Env,
    ) -> BoxFuture<'a, Result<Value, Interrupt>> {
        Box::pin(async move {
            match expr {
                Expr::Nil => Ok(Value::Nil),
                Expr::Bool(b) => Ok(Value::Bool(*b)),
                Expr::Num(n) => Ok(Value::Num(*n)),
                Expr::Str(s) => Ok(Value::string(s)),
                Expr::Keyword(k) => Ok(Value::keyword(k)),
                Expr::Sym(name) => env
                    .get(name)
                    .ok_or_else(|| Interrupt::runtime(format!("undefined symbol: {name}"))),
                Expr::Vector(items) => {
                    let mut out = Vec::with_capacity(items.len());
                    for item in items {
                        out.push(self.eval(item, env).await?);
                    }
                    Ok(Value::vector(out))
                }
                Expr::Map(pairs) => {
                    let mut out = std::collections::BTreeMap::new();
                    for (key_expr, value_expr) in pairs {
                        let key = self.eval(key_expr, env).await?;
                        let Some(key) = key.as_key().map(str::to_string) else {
                            return Err(Interrupt::runtime(format!(
                                "map key must be a keyword or string, got {}",
                                key.type_name()
                            )));
                        };
                        out.insert(key, self.eval(value_expr, env).await?);
                    }
                    Ok(Value::map(out))
                }
                Expr::List(items) => self.eval_list(items, env).await,
            }
        })
    }

    async fn eval_list(&self, items: &[Expr], env: &Env) -> Result<Value, Interrupt> {
        let Some(head) = items.first() else {
            return Ok(Value::Nil);
        };
        if let Expr::Sym(name) = head {
            match name.as_str() {
                "def" => return self.form_def(&items[1..], env).await,
                "set!" => return self.form_set(&items[1..], env).await,
                "fn" => return self.form_fn(&items[1..], env),
                "if" => return self.form_if(&items[1..], env).await,
                "do" => return self.eval_forms(&items[1..], env).await,
                "let" => return self.form_let(&items[1..], env).await,
                "while" => return self.form_while(&items[1..], env).await,
                "and" => return self.form_and(&items[1..], env).await,
                "or" => return self.form_or(&items[1..], env).await,
                _ => {}
            }
        }

        let f = self.eval(head, env).await?;
        let mut args = Vec::with_capacity(items.len() - 1);
        for item in &items[1..] {
            args.push(self.eval(item, env).await?);
        }
        self.apply(f, args).await
    }

    /// Applies a callable to arguments. Script closures are forgiving about
    /// arity: missing parameters bind to nil, extra arguments are dropped.
    pub async fn apply(&self, f: Value, args: Vec<Value>) -> Result<Value, Interrupt> {
        if self.is_cancelled() {
            return Err(Interrupt::Cancelled);
        }
        match f {
            Value::Native(native) => (native.call)(self.clone(), args).await,
            Value::Func(lambda) => {
                let env = lambda.env.child();
                let mut args = args.into_iter();
                for param in &lambda.params {
                    env.define(param.clone(), args.next().unwrap_or(Value::Nil));
                }
                let mut last = Value::Nil;
                for form in &lambda.body {
                    last = self.eval(form, &env).await?;
                }
                Ok(last)
            }
            other => Err(Interrupt::runtime(format!(
                "{} is not callable",
                other.type_name()
            ))),
        }
    }

    /// Owned-future variant of [`Interp::apply`] for host code that stores
    /// or races calls into script closures.
    pub fn call_value(
        &self,
        f: &Value,
        args: Vec<Value>,
    ) -> BoxFuture<'static, Result<Value, Interrupt>> {
        let interp = self.clone();
        let f = f.clone();
        Box::pin(async move { interp.apply(f, args).await })
    }

    async fn form_def(&self, rest: &[Expr], env: &Env) -> Result<Value, Interrupt> {
        let [Expr::Sym(name), value_expr] = rest else {
            return Err(Interrupt::runtime("def expects (def name expr)"));
        };
        let value = self.eval(value_expr, env).await?;
        env.define(name.clone(), value.clone());
        Ok(value)
    }

    async fn form_set(&self, rest: &[Expr], env: &Env) -> Result<Value, Interrupt> {
        let [Expr::Sym(name), value_expr] = rest else {
            return Err(Interrupt::runtime("set! expects (set! name expr)"));
        };
        let value = self.eval(value_expr, env).await?;
        if !env.assign(name, value.clone()) {
            return Err(Interrupt::runtime(format!(
                "set! of undefined symbol: {name}"
            )));
        }
        Ok(value)
    }

    fn form_fn(&self, rest: &[Expr], env: &Env) -> Result<Value, Interrupt> {
        let Some((Expr::Vector(params), body)) = rest.split_first() else {
            return Err(Interrupt::runtime("fn expects (fn [params] body...)"));
        };
        let mut names = Vec::with_capacity(params.len());
        for param in params {
            let Expr::Sym(name) = param else {
                return Err(Interrupt::runtime("fn parameters must be symbols"));
            };
            names.push(name.clone());
        }
        Ok(Value::Func(Arc::new(Lambda {
            params: names,
            body: body.to_vec(),
            env: env.clone(),
        })))
    }

    async fn form_if(&self, rest: &[Expr], env: &Env) -> Result<Value, Interrupt> {
        let (cond, branches) = rest
            .split_first()
            .ok_or_else(|| Interrupt::runtime("if expects (if cond then else?)"))?;
        if self.eval(cond, env).await?.truthy() {
            match branches.first() {
                Some(then) => self.eval(then, env).await,
                None => Ok(Value::Nil),
            }
        } else {
            match branches.get(1) {
                Some(other) => self.eval(other, env).await,
                None => Ok(Value::Nil),
            }
        }
    }

    async fn form_let(&self, rest: &[Expr], env: &Env) -> Result<Value, Interrupt> {
        let Some((Expr::Vector(bindings), body)) = rest.split_first() else {
            return Err(Interrupt::runtime("let expects (let [name expr ...] body...)"));
        };
        if bindings.len() % 2 != 0 {
            return Err(Interrupt::runtime(
                "let bindings require an even number of forms",
            ));
        }
        let scope = env.child();
        for pair in bindings.chunks(2) {
            let Expr::Sym(name) = &pair[0] else {
                return Err(Interrupt::runtime("let binding names must be symbols"));
            };
            let value = self.eval(&pair[1], &scope).await?;
            scope.define(name.clone(), value);
        }
        self.eval_forms(body, &scope).await
    }

    async fn form_while(&self, rest: &[Expr], env: &Env) -> Result<Value, Interrupt> {
        let (cond, body) = rest
            .split_first()
            .ok_or_else(|| Interrupt::runtime("while expects (while cond body...)"))?;
        while self.eval(cond, env).await?.truthy() {
            if self.is_cancelled() {
                return Err(Interrupt::Cancelled);
            }
            self.eval_forms(body, env).await?;
        }
        Ok(Value::Nil)
    }

    async fn form_and(&self, rest: &[Expr], env: &Env) -> Result<Value, Interrupt> {
        let mut last = Value::Bool(true);
        for expr in rest {
            last = self.eval(expr, env).await?;
            if !last.truthy() {
                return Ok(last);
            }
        }
        Ok(last)
    }

    async fn form_or(&self, rest: &[Expr], env: &Env) -> Result<Value, Interrupt> {
        for expr in rest {
            let value = self.eval(expr, env).await?;
            if value.truthy() {
                return Ok(value);
            }
        }
        Ok(Value::Nil)
    }
}
