use std::collections::{BTreeMap, BTreeSet};
use std::ffi::OsString;
use std::path::Path;

use semver::{Version, VersionReq};
use serde::Serialize;

use crate::common::error::ResAllocError;

/// `major.minor` of this crate, compared with the `runtime-version` constraint.
pub const RUNTIME_VERSION: &str = const_format::concatcp!(
    env!("CARGO_PKG_VERSION_MAJOR"),
    ".",
    env!("CARGO_PKG_VERSION_MINOR")
);

#[derive(Debug, Copy, Clone, PartialEq, Serialize)]
pub struct LoadAverage {
    pub one: f64,
    pub five: f64,
    pub fifteen: f64,
}

/// Answers questions about the environment in which workers of an allocator run.
pub trait CapabilityProbe: Send + Sync {
    /// Returns requirements from `requirements` that are not satisfied.
    fn missing_distributions(&self, requirements: &BTreeSet<String>) -> Vec<String>;

    /// Returns modules from `modules` that cannot be found.
    fn missing_modules(&self, modules: &BTreeSet<String>) -> Vec<String>;

    fn runtime_version(&self) -> &str;

    /// Returns `None` if the load average is not available on this platform.
    fn load_average(&self) -> Option<LoadAverage>;
}

/// Probe of the host on which this process runs.
pub struct SystemProbe {
    distributions: BTreeMap<String, Version>,
    module_path: Option<OsString>,
}

impl SystemProbe {
    pub fn new(distributions: BTreeMap<String, Version>, module_path: Option<OsString>) -> Self {
        Self {
            distributions,
            module_path,
        }
    }

    /// Creates a probe from `name -> version` pairs. Versions may omit trailing components.
    pub fn from_versions<'a>(
        distributions: impl IntoIterator<Item = (&'a String, &'a String)>,
        module_path: Option<OsString>,
    ) -> crate::Result<Self> {
        let distributions = distributions
            .into_iter()
            .map(|(name, version)| {
                parse_version(version)
                    .map(|version| (name.clone(), version))
                    .ok_or_else(|| {
                        ResAllocError::ConfigError(format!(
                            "Invalid version `{version}` of distribution `{name}`"
                        ))
                    })
            })
            .collect::<crate::Result<_>>()?;
        Ok(Self::new(distributions, module_path))
    }

    fn is_satisfied(&self, requirement: &str) -> bool {
        let Some((name, version_req)) = parse_requirement(requirement) else {
            log::debug!("Cannot parse distribution requirement `{requirement}`");
            return false;
        };
        match (self.distributions.get(name), version_req) {
            (Some(_), None) => true,
            (Some(version), Some(req)) => req.matches(version),
            (None, _) => false,
        }
    }

    fn find_module(&self, module: &str) -> bool {
        let result = match &self.module_path {
            Some(path) => which::which_in(module, Some(path), Path::new(".")),
            None => which::which(module),
        };
        match result {
            Ok(path) => {
                log::debug!("Module {module} found at {}", path.display());
                true
            }
            Err(error) => {
                log::info!("Module {module} not found: {error}");
                false
            }
        }
    }
}

impl CapabilityProbe for SystemProbe {
    fn missing_distributions(&self, requirements: &BTreeSet<String>) -> Vec<String> {
        requirements
            .iter()
            .filter(|requirement| !self.is_satisfied(requirement))
            .cloned()
            .collect()
    }

    fn missing_modules(&self, modules: &BTreeSet<String>) -> Vec<String> {
        modules
            .iter()
            .filter(|module| !self.find_module(module))
            .cloned()
            .collect()
    }

    fn runtime_version(&self) -> &str {
        RUNTIME_VERSION
    }

    #[cfg(target_os = "linux")]
    fn load_average(&self) -> Option<LoadAverage> {
        match psutil::host::loadavg() {
            Ok(load) => {
                let load = LoadAverage {
                    one: load.one,
                    five: load.five,
                    fifteen: load.fifteen,
                };
                log::debug!("Load average: {load:?}");
                Some(load)
            }
            Err(error) => {
                log::debug!("Cannot read load average: {error:?}");
                None
            }
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn load_average(&self) -> Option<LoadAverage> {
        None
    }
}

/// Probe with fixed answers.
#[derive(Debug, Clone)]
pub struct StaticProbe {
    distributions: BTreeSet<String>,
    modules: BTreeSet<String>,
    runtime_version: String,
    load_average: Option<LoadAverage>,
}

impl Default for StaticProbe {
    fn default() -> Self {
        Self {
            distributions: Default::default(),
            modules: Default::default(),
            runtime_version: RUNTIME_VERSION.to_string(),
            load_average: None,
        }
    }
}

impl StaticProbe {
    /// Requirements listed here are reported as satisfied, compared verbatim.
    pub fn with_distributions<I: IntoIterator<Item = S>, S: Into<String>>(
        mut self,
        items: I,
    ) -> Self {
        self.distributions = items.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_modules<I: IntoIterator<Item = S>, S: Into<String>>(mut self, items: I) -> Self {
        self.modules = items.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_runtime_version(mut self, version: &str) -> Self {
        self.runtime_version = version.to_string();
        self
    }

    pub fn with_load_average(mut self, load: Option<LoadAverage>) -> Self {
        self.load_average = load;
        self
    }
}

impl CapabilityProbe for StaticProbe {
    fn missing_distributions(&self, requirements: &BTreeSet<String>) -> Vec<String> {
        requirements.difference(&self.distributions).cloned().collect()
    }

    fn missing_modules(&self, modules: &BTreeSet<String>) -> Vec<String> {
        modules.difference(&self.modules).cloned().collect()
    }

    fn runtime_version(&self) -> &str {
        &self.runtime_version
    }

    fn load_average(&self) -> Option<LoadAverage> {
        self.load_average
    }
}

/// Parses `name`, `name==1.2` or `name>=1.2, <2` into a name and an optional version requirement.
fn parse_requirement(requirement: &str) -> Option<(&str, Option<VersionReq>)> {
    let requirement = requirement.trim();
    match requirement.find(['<', '>', '=', '!', '~', '^']) {
        None if requirement.is_empty() => None,
        None => Some((requirement, None)),
        Some(0) => None,
        Some(index) => {
            let (name, req) = requirement.split_at(index);
            let req = match req.strip_prefix("==") {
                Some(rest) => format!("={rest}"),
                None => req.to_string(),
            };
            let req = VersionReq::parse(&req).ok()?;
            Some((name.trim(), Some(req)))
        }
    }
}

/// Parses a version, filling in missing minor and patch components with zeros.
fn parse_version(version: &str) -> Option<Version> {
    let version = version.trim();
    if let Ok(parsed) = Version::parse(version) {
        return Some(parsed);
    }
    let components = version.split('.').count();
    let padded = match components {
        1 => format!("{version}.0.0"),
        2 => format!("{version}.0"),
        _ => return None,
    };
    Version::parse(&padded).ok()
}
