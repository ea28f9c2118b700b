//! Compute context configuration.
//!
//! Defaults can be layered with environment overrides through
//! [`ComputeConfig::from_env`]:
//! - `CLHOST_DEVICE_TYPE`: `cpu`, `gpu`, `accelerator` or `all`
//! - `CLHOST_BUILD_OPTIONS`: extra flags appended to every program build
//! - `CLHOST_INCLUDE_ROOT`: directory passed to the compiler as `-I`
//! - `CLHOST_RELEASE_LOCK=1`: serialise memory release process-wide
//! - `CLHOST_NO_PROGRAM_CACHE=1`: compile every program load from scratch

use std::path::{Path, PathBuf};

use log::warn;

use crate::runtime::opencl::DeviceType;

/// Settings for a [`ComputeContext`](crate::ComputeContext).
#[derive(Debug, Clone)]
pub struct ComputeConfig {
    /// Device class preferred by `setup`.
    pub device_type: DeviceType,

    /// Flags appended to every program build after the include path.
    pub build_options: Option<String>,

    /// Resource root handed to the compiler as an include directory.
    pub include_root: PathBuf,

    /// Serialise native memory release and buffer transfers behind one
    /// process-wide lock.
    ///
    /// Works around drivers that race on concurrent `clReleaseMemObject`.
    /// Costs throughput when many threads allocate and free at once.
    pub release_lock: bool,

    /// Reuse compiled programs for identical source and options.
    pub program_cache: bool,

    /// Publish the context as the ambient current context after setup.
    pub set_current: bool,
}

impl Default for ComputeConfig {
    fn default() -> Self {
        Self {
            device_type: DeviceType::Gpu,
            build_options: None,
            include_root: PathBuf::from("."),
            release_lock: false,
            program_cache: true,
            set_current: true,
        }
    }
}

impl ComputeConfig {
    /// Creates the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Default configuration with environment overrides applied.
    pub fn from_env() -> Self {
        Self::default().with_env_overrides(|key| std::env::var(key).ok())
    }

    /// Applies overrides from a variable lookup.
    pub fn with_env_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(value) = lookup("CLHOST_DEVICE_TYPE") {
            match value.parse() {
                Ok(device_type) => self.device_type = device_type,
                Err(e) => warn!("Ignoring CLHOST_DEVICE_TYPE: {}", e),
            }
        }
        if let Some(options) = lookup("CLHOST_BUILD_OPTIONS") {
            self.build_options = Some(options);
        }
        if let Some(root) = lookup("CLHOST_INCLUDE_ROOT") {
            self.include_root = PathBuf::from(root);
        }
        if lookup("CLHOST_RELEASE_LOCK").as_deref() == Some("1") {
            self.release_lock = true;
        }
        if lookup("CLHOST_NO_PROGRAM_CACHE").as_deref() == Some("1") {
            self.program_cache = false;
        }
        self
    }

    pub fn with_device_type(mut self, device_type: DeviceType) -> Self {
        self.device_type = device_type;
        self
    }

    pub fn with_build_options(mut self, options: impl Into<String>) -> Self {
        self.build_options = Some(options.into());
        self
    }

    pub fn with_include_root(mut self, root: impl AsRef<Path>) -> Self {
        self.include_root = root.as_ref().to_path_buf();
        self
    }

    pub fn with_release_lock(mut self, enabled: bool) -> Self {
        self.release_lock = enabled;
        self
    }

    pub fn with_program_cache(mut self, enabled: bool) -> Self {
        self.program_cache = enabled;
        self
    }

    pub fn with_set_current(mut self, enabled: bool) -> Self {
        self.set_current = enabled;
        self
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = ComputeConfig::default();
        assert_eq!(config.device_type, DeviceType::Gpu);
        assert!(config.build_options.is_none());
        assert!(!config.release_lock);
        assert!(config.program_cache);
        assert!(config.set_current);
    }

    #[test]
    fn test_env_overrides() {
        let config = ComputeConfig::default().with_env_overrides(lookup(&[
            ("CLHOST_DEVICE_TYPE", "cpu"),
            ("CLHOST_BUILD_OPTIONS", "-cl-fast-relaxed-math"),
            ("CLHOST_INCLUDE_ROOT", "/opt/kernels"),
            ("CLHOST_RELEASE_LOCK", "1"),
            ("CLHOST_NO_PROGRAM_CACHE", "1"),
        ]));
        assert_eq!(config.device_type, DeviceType::Cpu);
        assert_eq!(config.build_options.as_deref(), Some("-cl-fast-relaxed-math"));
        assert_eq!(config.include_root, PathBuf::from("/opt/kernels"));
        assert!(config.release_lock);
        assert!(!config.program_cache);
    }

    #[test]
    fn test_invalid_env_values_are_ignored() {
        let config = ComputeConfig::default().with_env_overrides(lookup(&[
            ("CLHOST_DEVICE_TYPE", "fpga"),
            ("CLHOST_RELEASE_LOCK", "yes"),
        ]));
        assert_eq!(config.device_type, DeviceType::Gpu);
        assert!(!config.release_lock);
    }

    #[test]
    fn test_builder() {
        let config = ComputeConfig::new()
            .with_device_type(DeviceType::All)
            .with_build_options("-DWIDTH=16")
            .with_include_root("kernels")
            .with_release_lock(true)
            .with_program_cache(false)
            .with_set_current(false);
        assert_eq!(config.device_type, DeviceType::All);
        assert_eq!(config.build_options.as_deref(), Some("-DWIDTH=16"));
        assert_eq!(config.include_root, PathBuf::from("kernels"));
        assert!(config.release_lock);
        assert!(!config.program_cache);
        assert!(!config.set_current);
    }
}
