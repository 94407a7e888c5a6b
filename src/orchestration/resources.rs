//! External collaborators reached from inside job bodies.
//!
//! The scheduler never inspects looked-up values and never provisions
//! anything itself. It only keeps the per-job [`ResourceLedger`] so that
//! cleanup knows what a failed job left behind.

use std::collections::HashMap;
use std::sync::Mutex;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// Structured query for a stored secret or material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceQuery {
    pub resource_type: String,
    pub name: String,
    /// Fail instead of returning `null` when absent.
    pub must_exist: bool,
    pub decrypt: bool,
    /// Project the stored object onto these fields. Empty means all fields.
    pub fields: Vec<String>,
}

impl ResourceQuery {
    pub fn new(resource_type: &str, name: &str) -> Self {
        Self {
            resource_type: resource_type.to_string(),
            name: name.to_string(),
            must_exist: true,
            decrypt: false,
            fields: Vec::new(),
        }
    }

    pub fn optional(mut self) -> Self {
        self.must_exist = false;
        self
    }

    pub fn decrypt(mut self) -> Self {
        self.decrypt = true;
        self
    }

    pub fn fields(mut self, fields: &[&str]) -> Self {
        self.fields = fields.iter().map(|f| f.to_string()).collect();
        self
    }
}

/// Looks up secrets and materials by structured query.
pub trait ResourceLookup: Send + Sync {
    fn lookup<'a>(&'a self, query: &'a ResourceQuery) -> BoxFuture<'a, Result<Value>>;
}

/// In-memory [`ResourceLookup`] keyed by `(resource_type, name)`.
///
/// Values inserted with `sealed = true` are only returned when the query
/// asks for decryption.
#[derive(Default)]
pub struct MemoryResources {
    entries: Mutex<HashMap<(String, String), (Value, bool)>>,
}

impl MemoryResources {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, resource_type: &str, name: &str, value: Value) {
        self.put(resource_type, name, value, false);
    }

    pub fn insert_sealed(&self, resource_type: &str, name: &str, value: Value) {
        self.put(resource_type, name, value, true);
    }

    fn put(&self, resource_type: &str, name: &str, value: Value, sealed: bool) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert((resource_type.to_string(), name.to_string()), (value, sealed));
        }
    }

    fn find(&self, query: &ResourceQuery) -> Result<Value> {
        let entries = self
            .entries
            .lock()
            .map_err(|_| Error::Resource("resource store poisoned".into()))?;
        let key = (query.resource_type.clone(), query.name.clone());
        let Some((value, sealed)) = entries.get(&key) else {
            if query.must_exist {
                return Err(Error::Resource(format!(
                    "{} {} does not exist",
                    query.resource_type, query.name
                )));
            }
            return Ok(Value::Null);
        };
        if *sealed && !query.decrypt {
            return Err(Error::Resource(format!(
                "{} {} is encrypted; query without decrypt",
                query.resource_type, query.name
            )));
        }
        if query.fields.is_empty() {
            return Ok(value.clone());
        }
        let object = value.as_object().ok_or_else(|| {
            Error::Resource(format!(
                "{} {} has no fields to select",
                query.resource_type, query.name
            ))
        })?;
        let mut selected = Map::new();
        for field in &query.fields {
            let v = object.get(field).ok_or_else(|| {
                Error::Resource(format!(
                    "{} {} has no field {}",
                    query.resource_type, query.name, field
                ))
            })?;
            selected.insert(field.clone(), v.clone());
        }
        Ok(Value::Object(selected))
    }
}

impl ResourceLookup for MemoryResources {
    fn lookup<'a>(&'a self, query: &'a ResourceQuery) -> BoxFuture<'a, Result<Value>> {
        async move { self.find(query) }.boxed()
    }
}

/// Identity of something a job provisioned.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceRef {
    pub resource_type: String,
    pub name: String,
}

impl ResourceRef {
    pub fn new(resource_type: &str, name: &str) -> Self {
        Self {
            resource_type: resource_type.to_string(),
            name: name.to_string(),
        }
    }
}

impl std::fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.resource_type, self.name)
    }
}

/// Result of asking the provisioner to destroy one resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Teardown {
    Removed,
    AlreadyAbsent,
}

/// Destroys infrastructure on behalf of cleanup.
pub trait Provisioner: Send + Sync {
    fn destroy<'a>(&'a self, resource: &'a ResourceRef) -> BoxFuture<'a, Result<Teardown>>;
}

/// Provisioner for runs whose jobs do not create external resources.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopProvisioner;

impl Provisioner for NoopProvisioner {
    fn destroy<'a>(&'a self, _resource: &'a ResourceRef) -> BoxFuture<'a, Result<Teardown>> {
        async { Ok(Teardown::AlreadyAbsent) }.boxed()
    }
}

/// Resources one job provisioned across all of its attempts.
#[derive(Debug, Clone, Default)]
pub struct ResourceLedger {
    entries: Vec<LedgerEntry>,
}

#[derive(Debug, Clone)]
struct LedgerEntry {
    resource: ResourceRef,
    released: bool,
}

impl ResourceLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a resource. Recording the same resource twice is a no-op.
    pub fn record(&mut self, resource: ResourceRef) {
        if self.entries.iter().any(|e| e.resource == resource) {
            return;
        }
        self.entries.push(LedgerEntry {
            resource,
            released: false,
        });
    }

    /// Resources not yet released, most recent first.
    pub fn outstanding(&self) -> Vec<ResourceRef> {
        self.entries
            .iter()
            .rev()
            .filter(|e| !e.released)
            .map(|e| e.resource.clone())
            .collect()
    }

    pub fn mark_released(&mut self, resource: &ResourceRef) {
        if let Some(entry) = self.entries.iter_mut().find(|e| &e.resource == resource) {
            entry.released = true;
        }
    }

    pub fn all(&self) -> Vec<ResourceRef> {
        self.entries.iter().map(|e| e.resource.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
