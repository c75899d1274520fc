use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::common::error::ResAllocError;

/// Keys understood in a resource request.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKey {
    LocalhostOnly,
    MaxCpus,
    RequiredDistributions,
    OrphanModules,
    RuntimeVersion,
}

impl ResourceKey {
    /// Keys in the order in which allocators evaluate them.
    pub const ALL: [ResourceKey; 5] = [
        ResourceKey::LocalhostOnly,
        ResourceKey::MaxCpus,
        ResourceKey::RequiredDistributions,
        ResourceKey::OrphanModules,
        ResourceKey::RuntimeVersion,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKey::LocalhostOnly => "localhost-only",
            ResourceKey::MaxCpus => "max-cpus",
            ResourceKey::RequiredDistributions => "required-distributions",
            ResourceKey::OrphanModules => "orphan-modules",
            ResourceKey::RuntimeVersion => "runtime-version",
        }
    }

    pub fn parse(key: &str) -> Option<ResourceKey> {
        Self::ALL.into_iter().find(|k| k.as_str() == key)
    }
}

impl Display for ResourceKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Constraints that a worker must satisfy.
///
/// The set of keys is closed: unknown keys are rejected when the request is parsed, so an
/// allocator never sees a constraint it does not understand.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct ResourceRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    localhost_only: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    max_cpus: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    required_distributions: Option<BTreeSet<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    orphan_modules: Option<BTreeSet<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    runtime_version: Option<String>,
}

impl ResourceRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_localhost_only(mut self, value: bool) -> Self {
        self.localhost_only = Some(value);
        self
    }

    pub fn with_max_cpus(mut self, value: u32) -> Self {
        self.max_cpus = Some(value);
        self
    }

    pub fn with_required_distributions<I, S>(mut self, requirements: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_distributions = Some(requirements.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_orphan_modules<I, S>(mut self, modules: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.orphan_modules = Some(modules.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_runtime_version<S: Into<String>>(mut self, version: S) -> Self {
        self.runtime_version = Some(version.into());
        self
    }

    pub fn localhost_only(&self) -> Option<bool> {
        self.localhost_only
    }

    pub fn max_cpus(&self) -> Option<u32> {
        self.max_cpus
    }

    pub fn required_distributions(&self) -> Option<&BTreeSet<String>> {
        self.required_distributions.as_ref()
    }

    pub fn orphan_modules(&self) -> Option<&BTreeSet<String>> {
        self.orphan_modules.as_ref()
    }

    pub fn runtime_version(&self) -> Option<&str> {
        self.runtime_version.as_deref()
    }

    /// Keys present in this request, in evaluation order.
    pub fn keys(&self) -> impl Iterator<Item = ResourceKey> + '_ {
        ResourceKey::ALL
            .into_iter()
            .filter(|key| self.value_of(*key).is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.keys().next().is_none()
    }

    /// Returns the value of `key` as JSON, used when reporting criteria.
    pub fn value_of(&self, key: ResourceKey) -> Option<Value> {
        match key {
            ResourceKey::LocalhostOnly => self.localhost_only.map(Value::from),
            ResourceKey::MaxCpus => self.max_cpus.map(Value::from),
            ResourceKey::RequiredDistributions => self
                .required_distributions
                .as_ref()
                .map(|set| Value::from_iter(set.iter().cloned())),
            ResourceKey::OrphanModules => self
                .orphan_modules
                .as_ref()
                .map(|set| Value::from_iter(set.iter().cloned())),
            ResourceKey::RuntimeVersion => self.runtime_version.clone().map(Value::from),
        }
    }

    pub fn from_json(text: &str) -> crate::Result<Self> {
        serde_json::from_str(text).map_err(|e| ResAllocError::InvalidRequest(e.to_string()))
    }

    pub fn from_toml(text: &str) -> crate::Result<Self> {
        toml::from_str(text).map_err(|e| ResAllocError::InvalidRequest(e.to_string()))
    }

    /// Builds a request from `key=value` assignments.
    ///
    /// Set-valued keys take a comma separated list. Other values are parsed as JSON when possible
    /// and taken as a plain string otherwise.
    pub fn from_assignments<S: AsRef<str>>(assignments: &[S]) -> crate::Result<Self> {
        let mut map = serde_json::Map::new();
        for assignment in assignments {
            let assignment = assignment.as_ref();
            let (key, value) = assignment.split_once('=').ok_or_else(|| {
                ResAllocError::InvalidRequest(format!(
                    "expected `key=value`, got `{assignment}`"
                ))
            })?;
            let key = key.trim();
            let parsed_key = ResourceKey::parse(key).ok_or_else(|| {
                ResAllocError::InvalidRequest(format!("unknown resource key `{key}`"))
            })?;
            let value = value.trim();
            let value = match parsed_key {
                ResourceKey::RequiredDistributions | ResourceKey::OrphanModules => {
                    Value::from_iter(
                        value
                            .split(',')
                            .map(str::trim)
                            .filter(|item| !item.is_empty())
                            .map(str::to_string),
                    )
                }
                ResourceKey::RuntimeVersion => Value::from(value),
                ResourceKey::LocalhostOnly | ResourceKey::MaxCpus => {
                    serde_json::from_str(value).unwrap_or_else(|_| Value::from(value))
                }
            };
            if map.insert(key.to_string(), value).is_some() {
                return Err(ResAllocError::InvalidRequest(format!(
                    "resource key `{key}` was specified multiple times"
                )));
            }
        }
        Self::from_map(map)
    }

    pub fn from_map(map: serde_json::Map<String, Value>) -> crate::Result<Self> {
        serde_json::from_value(Value::Object(map))
            .map_err(|e| ResAllocError::InvalidRequest(e.to_string()))
    }
}
