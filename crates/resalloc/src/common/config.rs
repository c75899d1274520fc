use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::allocation::cluster::MachineDescriptor;
use crate::allocation::local::{DEFAULT_MAX_LOAD, DEFAULT_TOTAL_CPUS, LOCAL_ALLOCATOR_NAME};
use crate::common::error::config_error;

fn deserialize_human_duration_opt<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    let buf = Option::<String>::deserialize(deserializer)?;
    buf.map(|b| humantime::parse_duration(&b).map_err(serde::de::Error::custom))
        .transpose()
}

fn default_total_cpus() -> u32 {
    DEFAULT_TOTAL_CPUS
}

fn default_max_load() -> f64 {
    DEFAULT_MAX_LOAD
}

/// Configuration of the local allocator.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct LocalConfig {
    #[serde(default = "default_total_cpus")]
    pub total_cpus: u32,

    #[serde(default = "default_max_load")]
    pub max_load: f64,

    /// Search path for orphan modules. `PATH` is used when missing.
    #[serde(default)]
    pub module_path: Option<String>,

    /// Installed distributions and their versions.
    #[serde(default)]
    pub distributions: BTreeMap<String, String>,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            total_cpus: DEFAULT_TOTAL_CPUS,
            max_load: DEFAULT_MAX_LOAD,
            module_path: None,
            distributions: Default::default(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ClusterConfig {
    pub name: String,
    pub machines: Vec<MachineDescriptor>,
}

/// Contents of a configuration file.
#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ResAllocConfig {
    /// Overrides the interval in which a shortage of capacity is polled.
    #[serde(default)]
    #[serde(deserialize_with = "deserialize_human_duration_opt")]
    pub poll_interval: Option<Duration>,

    #[serde(default)]
    pub local: LocalConfig,

    #[serde(default)]
    pub clusters: Vec<ClusterConfig>,
}

impl ResAllocConfig {
    pub fn load(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> crate::Result<Self> {
        let config: ResAllocConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> crate::Result<()> {
        if self.local.total_cpus == 0 {
            return config_error("`local.total_cpus` has to be at least 1");
        }
        if self.local.max_load.is_nan() || self.local.max_load <= 0.0 {
            return config_error(format!(
                "`local.max_load` has to be positive, not {}",
                self.local.max_load
            ));
        }
        let mut names = BTreeSet::from([LOCAL_ALLOCATOR_NAME]);
        for cluster in &self.clusters {
            if !names.insert(cluster.name.as_str()) {
                return config_error(format!("Allocator name `{}` is used twice", cluster.name));
            }
            if cluster.machines.is_empty() {
                return config_error(format!("Cluster `{}` has no machines", cluster.name));
            }
        }
        Ok(())
    }
}
