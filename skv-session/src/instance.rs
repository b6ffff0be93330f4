//! # Instances and Resolution
//!
//! An `InstanceDescriptor` is what the pool cache keys on. Resolvers turn a
//! logical `InstanceName` (project/location/id) into one; discovery against a
//! control plane lives outside this crate, behind `InstanceResolver`.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{SessionError, SessionResult};

/// Logical identity of a backend instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceName {
    pub project: String,
    pub location: String,
    pub instance_id: String,
}

impl InstanceName {
    pub fn new(
        project: impl Into<String>,
        location: impl Into<String>,
        instance_id: impl Into<String>,
    ) -> Self {
        InstanceName {
            project: project.into(),
            location: location.into(),
            instance_id: instance_id.into(),
        }
    }

    /// Full resource path, used as the instance key.
    pub fn resource_path(&self) -> String {
        format!(
            "projects/{}/locations/{}/instances/{}",
            self.project, self.location, self.instance_id
        )
    }
}

impl fmt::Display for InstanceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.resource_path())
    }
}

/// Network identity of a backend instance. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceDescriptor {
    key: String,
    host: String,
    port: u16,
}

impl InstanceDescriptor {
    pub fn new(key: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        InstanceDescriptor {
            key: key.into(),
            host: host.into(),
            port,
        }
    }

    /// Unique key; one pool exists per key.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

/// Supplies descriptors for logical instance names.
pub trait InstanceResolver: Send + Sync {
    /// Resolves `name`; failures are `SessionError::InstanceResolution`.
    fn resolve(&self, name: &InstanceName) -> SessionResult<InstanceDescriptor>;
}

impl<F> InstanceResolver for F
where
    F: Fn(&InstanceName) -> SessionResult<InstanceDescriptor> + Send + Sync,
{
    fn resolve(&self, name: &InstanceName) -> SessionResult<InstanceDescriptor> {
        self(name)
    }
}

/// Resolver over a fixed table, typically filled from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticInstanceResolver {
    entries: HashMap<InstanceName, InstanceDescriptor>,
}

impl StaticInstanceResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `name` at `host:port`, keyed by its resource path.
    pub fn insert(&mut self, name: InstanceName, host: impl Into<String>, port: u16) {
        let descriptor = InstanceDescriptor::new(name.resource_path(), host, port);
        self.entries.insert(name, descriptor);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl InstanceResolver for StaticInstanceResolver {
    fn resolve(&self, name: &InstanceName) -> SessionResult<InstanceDescriptor> {
        self.entries
            .get(name)
            .cloned()
            .ok_or_else(|| SessionError::InstanceResolution {
                name: name.resource_path(),
                reason: "instance is not configured".to_string(),
            })
    }
}
