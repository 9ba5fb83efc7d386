//! Mirror run configuration

use crate::error::{MirrorError, Result};
use crate::manifest::Platform;
use regex::Regex;
use std::env;
use std::path::PathBuf;

pub const DEFAULT_MAX_REGISTRY: usize = 4;
pub const DEFAULT_MAX_PER_REGISTRY: usize = 6;

/// Selects manifest list entries by matching `<os>/<arch>[/<variant>]` against a regex
#[derive(Debug, Clone)]
pub struct PlatformFilter {
    pattern: Regex,
}

impl PlatformFilter {
    pub fn new(pattern: &str) -> Result<Self> {
        let pattern = Regex::new(pattern).map_err(|e| {
            MirrorError::Validation(format!(
                "--filter-by-os was not a valid regular expression: {}",
                e
            ))
        })?;
        Ok(Self { pattern })
    }

    pub fn matches(&self, platform: &Platform) -> bool {
        let name = match platform.variant.as_deref() {
            Some(variant) if !variant.is_empty() => {
                format!("{}/{}/{}", platform.os, platform.architecture, variant)
            }
            _ => format!("{}/{}", platform.os, platform.architecture),
        };
        self.pattern.is_match(&name)
    }

    pub fn as_str(&self) -> &str {
        self.pattern.as_str()
    }
}

#[derive(Debug, Clone)]
pub struct MirrorOptions {
    pub dry_run: bool,
    pub insecure: bool,
    pub skip_mount: bool,
    pub skip_multiple_scopes: bool,
    pub force: bool,
    pub filter_by_os: Option<PlatformFilter>,
    /// Number of registries contacted concurrently
    pub max_registry: usize,
    /// Number of concurrent requests per registry
    pub max_per_registry: usize,
    pub s3_source_buckets: Vec<String>,
    /// Docker `config.json` to read credentials from
    pub registry_config: Option<PathBuf>,
}

impl Default for MirrorOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            insecure: false,
            skip_mount: false,
            skip_multiple_scopes: false,
            force: false,
            filter_by_os: None,
            max_registry: DEFAULT_MAX_REGISTRY,
            max_per_registry: DEFAULT_MAX_PER_REGISTRY,
            s3_source_buckets: Vec::new(),
            registry_config: None,
        }
    }
}

impl MirrorOptions {
    /// Apply `IMAGE_MIRROR_*` environment overrides on top of the current values
    pub fn from_env(mut self) -> Self {
        if let Some(n) = env_usize("IMAGE_MIRROR_MAX_REGISTRY") {
            self.max_registry = n;
        }
        if let Some(n) = env_usize("IMAGE_MIRROR_MAX_PER_REGISTRY") {
            self.max_per_registry = n;
        }
        if env_flag("IMAGE_MIRROR_INSECURE") {
            self.insecure = true;
        }
        if env_flag("IMAGE_MIRROR_FORCE") {
            self.force = true;
        }
        self
    }

    pub fn with_filter(mut self, pattern: &str) -> Result<Self> {
        self.filter_by_os = if pattern.is_empty() {
            None
        } else {
            Some(PlatformFilter::new(pattern)?)
        };
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_registry == 0 {
            return Err(MirrorError::Validation(
                "--max-registry must be greater than zero".to_string(),
            ));
        }
        if self.max_per_registry == 0 {
            return Err(MirrorError::Validation(
                "--max-per-registry must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// True when the platform passes the `--filter-by-os` filter (or no filter is set)
    pub fn include_platform(&self, platform: &Platform) -> bool {
        self.filter_by_os
            .as_ref()
            .is_none_or(|filter| filter.matches(platform))
    }
}

fn env_usize(name: &str) -> Option<usize> {
    env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

fn env_flag(name: &str) -> bool {
    env::var(name).is_ok_and(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "yes"))
}
