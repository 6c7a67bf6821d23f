//! Capability tables mapping wire method names to owner handlers.
//!
//! Each owner type builds one [`MethodTable`] at construction. A request can
//! only reach the handlers registered there; anything else is answered with
//! an `AttributeError`.

use crate::wire::RemoteFault;
use crate::{OrbError, Result};
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;

/// A registered RPC handler: the owner plus positional arguments.
pub type Handler<T> = for<'a> fn(&'a T, Vec<Value>) -> BoxFuture<'a, Result<Value>>;

/// Name → handler table for one owner type.
pub struct MethodTable<T> {
    methods: HashMap<&'static str, Handler<T>>,
}

impl<T> Default for MethodTable<T> {
    fn default() -> Self {
        Self {
            methods: HashMap::new(),
        }
    }
}

impl<T> MethodTable<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `name`, replacing any previous entry.
    pub fn with(mut self, name: &'static str, handler: Handler<T>) -> Self {
        self.methods.insert(name, handler);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    /// Registered method names, sorted.
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.methods.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// Look up `method` and run it on `owner`.
    pub async fn invoke(
        &self,
        owner: &T,
        method: &str,
        args: Vec<Value>,
    ) -> std::result::Result<Value, RemoteFault> {
        let handler = self
            .methods
            .get(method)
            .ok_or_else(|| RemoteFault::attribute_error(method))?;
        handler(owner, args).await.map_err(|e| e.to_fault())
    }
}

/// Fail unless exactly `count` arguments were supplied.
pub fn expect_arity(method: &str, args: &[Value], count: usize) -> Result<()> {
    if args.len() == count {
        Ok(())
    } else {
        Err(OrbError::InvalidArguments {
            method: method.to_string(),
            message: format!("takes {} positional arguments but {} were given", count, args.len()),
        })
    }
}

/// Decode the positional argument at `index`.
pub fn arg<T: DeserializeOwned>(method: &str, args: &[Value], index: usize) -> Result<T> {
    let value = args.get(index).ok_or_else(|| OrbError::InvalidArguments {
        method: method.to_string(),
        message: format!("missing positional argument {}", index),
    })?;
    serde_json::from_value(value.clone()).map_err(|e| OrbError::InvalidArguments {
        method: method.to_string(),
        message: format!("argument {}: {}", index, e),
    })
}

/// Encode a handler's return value.
pub fn reply<T: serde::Serialize>(value: T) -> Result<Value> {
    Ok(serde_json::to_value(value)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Counter {
        base: i64,
    }

    fn add(counter: &Counter, args: Vec<Value>) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            expect_arity("add", &args, 1)?;
            let n: i64 = arg("add", &args, 0)?;
            reply(counter.base + n)
        })
    }

    fn table() -> MethodTable<Counter> {
        MethodTable::new().with("add", add)
    }

    #[tokio::test]
    async fn test_invoke_registered_method() {
        let counter = Counter { base: 10 };
        let result = table().invoke(&counter, "add", vec![json!(5)]).await.unwrap();
        assert_eq!(result, json!(15));
    }

    #[tokio::test]
    async fn test_unknown_method_is_attribute_error() {
        let counter = Counter { base: 0 };
        let fault = table().invoke(&counter, "sub", vec![]).await.unwrap_err();
        assert_eq!(fault.name, "AttributeError");
    }

    #[tokio::test]
    async fn test_bad_arguments_are_type_errors() {
        let counter = Counter { base: 0 };
        let fault = table().invoke(&counter, "add", vec![]).await.unwrap_err();
        assert_eq!(fault.name, "TypeError");

        let fault = table()
            .invoke(&counter, "add", vec![json!("five")])
            .await
            .unwrap_err();
        assert_eq!(fault.name, "TypeError");
    }

    #[test]
    fn test_names_sorted() {
        let names = table().with("check", add).names();
        assert_eq!(names, vec!["add", "check"]);
    }
}
