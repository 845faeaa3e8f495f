//! The exposable object model.
//!
//! Anything served through an endpoint implements [`Target`]. Property
//! reads and writes are synchronous against local state; invocation and
//! construction are asynchronous. [`Object`], [`Function`] and
//! [`Constructor`] cover the common graph shapes without a hand-written
//! impl.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;

use crate::error::CallError;
use crate::value::Value;

/// An object that can be exposed through an endpoint.
///
/// Every operation defaults to the failure a plain value would produce, so
/// implementations only override what they support. `finalize` runs when
/// the exposing endpoint is released.
#[async_trait]
pub trait Target: Send + Sync {
    fn get(&self, property: &str) -> Result<Value, CallError> {
        Err(CallError::type_error(format!(
            "no such property: {property}"
        )))
    }

    fn set(&self, property: &str, _value: Value) -> Result<(), CallError> {
        Err(CallError::type_error(format!(
            "cannot set property: {property}"
        )))
    }

    async fn apply(&self, _args: Vec<Value>) -> Result<Value, CallError> {
        Err(CallError::type_error("target is not callable"))
    }

    async fn construct(&self, _args: Vec<Value>) -> Result<Arc<dyn Target>, CallError> {
        Err(CallError::type_error("target is not a constructor"))
    }

    fn finalize(&self) {}
}

fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Mutable property bag; the simplest graph node.
#[derive(Default)]
pub struct Object {
    properties: Mutex<HashMap<String, Value>>,
}

impl Object {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style property insertion.
    pub fn with(self, property: impl Into<String>, value: Value) -> Self {
        self.insert(property, value);
        self
    }

    pub fn insert(&self, property: impl Into<String>, value: Value) {
        lock_or_recover(&self.properties).insert(property.into(), value);
    }
}

#[async_trait]
impl Target for Object {
    fn get(&self, property: &str) -> Result<Value, CallError> {
        lock_or_recover(&self.properties)
            .get(property)
            .cloned()
            .ok_or_else(|| CallError::type_error(format!("no such property: {property}")))
    }

    fn set(&self, property: &str, value: Value) -> Result<(), CallError> {
        lock_or_recover(&self.properties).insert(property.to_string(), value);
        Ok(())
    }
}

type AsyncCall = dyn Fn(Vec<Value>) -> BoxFuture<'static, Result<Value, CallError>> + Send + Sync;

/// A callable leaf of the object graph.
pub struct Function {
    call: Box<AsyncCall>,
}

impl Function {
    pub fn new<F, Fut>(call: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, CallError>> + Send + 'static,
    {
        Self {
            call: Box::new(move |args| call(args).boxed()),
        }
    }
}

#[async_trait]
impl Target for Function {
    async fn apply(&self, args: Vec<Value>) -> Result<Value, CallError> {
        (self.call)(args).await
    }
}

type Factory = dyn Fn(Vec<Value>) -> Result<Arc<dyn Target>, CallError> + Send + Sync;

/// A constructible leaf: `CONSTRUCT` requests build a fresh target, which
/// always goes back to the caller remotely addressable, never copied.
pub struct Constructor {
    build: Box<Factory>,
}

impl Constructor {
    pub fn new<F>(build: F) -> Self
    where
        F: Fn(Vec<Value>) -> Result<Arc<dyn Target>, CallError> + Send + Sync + 'static,
    {
        Self {
            build: Box::new(build),
        }
    }
}

#[async_trait]
impl Target for Constructor {
    async fn construct(&self, args: Vec<Value>) -> Result<Arc<dyn Target>, CallError> {
        (self.build)(args)
    }
}
