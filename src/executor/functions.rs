//! Registry of callables an executor can run
//!
//! Code cannot travel over the wire, so a `DataPacket` names its function
//! and the executor looks the name up here. Functions are registered either
//! explicitly or statically through the `#[remote_fn]` attribute, which adds
//! an entry to the `REMOTE_FNS` distributed slice.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::core::errors::{PoolError, Result};

/// A function that can be invoked by name on an executor
pub trait RemoteFn: Send + Sync + 'static {
    /// Name used in `FuncRef`s
    fn name(&self) -> &str;

    /// Invoke with positional arguments
    fn call(&self, args: Vec<Value>) -> anyhow::Result<Value>;
}

impl fmt::Debug for dyn RemoteFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RemoteFn({})", self.name())
    }
}

/// Closure-backed `RemoteFn`
pub struct FnRemote<F> {
    name: String,
    func: F,
}

impl<F> FnRemote<F>
where
    F: Fn(Vec<Value>) -> anyhow::Result<Value> + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            func,
        }
    }
}

impl<F> RemoteFn for FnRemote<F>
where
    F: Fn(Vec<Value>) -> anyhow::Result<Value> + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn call(&self, args: Vec<Value>) -> anyhow::Result<Value> {
        (self.func)(args)
    }
}

// Global function registration using linkme
#[linkme::distributed_slice]
pub static REMOTE_FNS: [fn() -> Arc<dyn RemoteFn>] = [..];

/// Name → callable lookup table shared by an executor and its local pool
#[derive(Clone, Default)]
pub struct FunctionRegistry {
    functions: Arc<DashMap<String, Arc<dyn RemoteFn>>>,
}

lazy_static::lazy_static! {
    static ref GLOBAL_FUNCTIONS: FunctionRegistry = FunctionRegistry::with_static();
}

impl FunctionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            functions: Arc::new(DashMap::new()),
        }
    }

    /// Create a registry holding every `#[remote_fn]` linked into the binary
    pub fn with_static() -> Self {
        let registry = Self::new();
        for register in REMOTE_FNS {
            let func = register();
            debug!(function = func.name(), "registering static remote function");
            registry.functions.insert(func.name().to_string(), func);
        }
        registry
    }

    /// Process-wide registry, built from the static functions on first use
    pub fn global() -> FunctionRegistry {
        GLOBAL_FUNCTIONS.clone()
    }

    /// Register a callable; names must be unique
    pub fn register(&self, func: Arc<dyn RemoteFn>) -> Result<()> {
        let name = func.name().to_string();
        if self.functions.contains_key(&name) {
            return Err(PoolError::state(
                "function registry",
                format!("function '{}' already registered", name),
            ));
        }
        self.functions.insert(name, func);
        Ok(())
    }

    /// Register a closure under `name`
    pub fn register_fn<F>(&self, name: &str, func: F) -> Result<()>
    where
        F: Fn(Vec<Value>) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.register(Arc::new(FnRemote::new(name, func)))
    }

    /// Get a callable by name
    pub fn get(&self, name: &str) -> Option<Arc<dyn RemoteFn>> {
        self.functions.get(name).map(|entry| entry.value().clone())
    }

    /// Get a callable by name, failing if it is unknown
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn RemoteFn>> {
        self.get(name).ok_or_else(|| PoolError::FunctionNotFound {
            name: name.to_string(),
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    /// List all registered names, sorted
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.functions.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

impl fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionRegistry")
            .field("functions", &self.list())
            .finish()
    }
}

/// Fail unless `args` holds at most `arity` values
#[doc(hidden)]
pub fn check_arity(function: &str, args: &[Value], arity: usize) -> anyhow::Result<()> {
    if args.len() > arity {
        anyhow::bail!(
            "{}() takes {} positional argument(s) but {} were given",
            function,
            arity,
            args.len()
        );
    }
    Ok(())
}

/// Decode one positional argument; a missing one decodes from `null`
#[doc(hidden)]
pub fn decode_arg<T: DeserializeOwned>(
    function: &str,
    param: &str,
    value: Option<Value>,
) -> anyhow::Result<T> {
    let missing = value.is_none();
    serde_json::from_value(value.unwrap_or(Value::Null)).map_err(|e| {
        if missing {
            anyhow::anyhow!("{}() missing required argument '{}'", function, param)
        } else {
            anyhow::anyhow!("{}() argument '{}': {}", function, param, e)
        }
    })
}

/// Encode a function's return value
#[doc(hidden)]
pub fn encode_output<T: Serialize>(function: &str, output: T) -> anyhow::Result<Value> {
    serde_json::to_value(output)
        .map_err(|e| anyhow::anyhow!("{}() returned an unserializable value: {}", function, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn register_and_resolve() {
        let registry = FunctionRegistry::new();
        registry
            .register_fn("double", |args| {
                let x = args[0].as_i64().unwrap_or_default();
                Ok(json!(x * 2))
            })
            .unwrap();

        assert!(registry.contains("double"));
        let func = registry.resolve("double").unwrap();
        assert_eq!(func.call(vec![json!(21)]).unwrap(), json!(42));
        assert!(matches!(
            registry.resolve("triple"),
            Err(PoolError::FunctionNotFound { .. })
        ));
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let registry = FunctionRegistry::new();
        registry.register_fn("noop", |_| Ok(Value::Null)).unwrap();
        assert!(registry.register_fn("noop", |_| Ok(Value::Null)).is_err());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn clones_share_entries() {
        let registry = FunctionRegistry::new();
        let view = registry.clone();
        registry.register_fn("a", |_| Ok(Value::Null)).unwrap();
        assert_eq!(view.list(), vec!["a".to_string()]);
    }

    #[test]
    fn argument_helpers() {
        assert!(check_arity("f", &[json!(1), json!(2)], 1).is_err());
        let x: i64 = decode_arg("f", "x", Some(json!(5))).unwrap();
        assert_eq!(x, 5);
        let opt: Option<i64> = decode_arg("f", "y", None).unwrap();
        assert_eq!(opt, None);
        let err = decode_arg::<i64>("f", "z", None).unwrap_err();
        assert!(err.to_string().contains("missing required argument 'z'"));
    }
}
