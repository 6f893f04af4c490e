use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::VmError;

/// File name of the declarative VM description inside a VM's directory.
pub const VM_SPEC_FILE: &str = "vm.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortForward {
    pub host_port: u16,
    pub guest_port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedFolder {
    /// virtiofs mount tag (e.g. `share`).
    pub tag: String,
    pub host_path: PathBuf,
    #[serde(default)]
    pub readonly: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmPowerState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Crashed,
}

fn default_memory_mb() -> u64 {
    4096
}

fn default_cpu_count() -> u32 {
    4
}

/// Persisted description of one VM; a directory per VM holds this as
/// [`VM_SPEC_FILE`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmSpec {
    pub name: String,
    pub vm_id: String,
    #[serde(default)]
    pub kernel_path: PathBuf,
    #[serde(default)]
    pub initrd_path: Option<PathBuf>,
    #[serde(default)]
    pub disk_path: Option<PathBuf>,
    #[serde(default)]
    pub cmdline: String,
    #[serde(default = "default_memory_mb")]
    pub memory_mb: u64,
    #[serde(default = "default_cpu_count")]
    pub cpu_count: u32,
    #[serde(default)]
    pub nat_enabled: bool,
    #[serde(default)]
    pub port_forwards: Vec<PortForward>,
    #[serde(default)]
    pub shared_folders: Vec<SharedFolder>,
}

impl VmSpec {
    pub fn validate(&self) -> Result<(), VmError> {
        if self.cpu_count == 0 {
            return Err(VmError::InvalidSpec("cpu_count must be at least 1".into()));
        }
        if self.memory_mb == 0 {
            return Err(VmError::InvalidSpec("memory_mb must be non-zero".into()));
        }
        if self.memory_mb.checked_mul(1024 * 1024).is_none() {
            return Err(VmError::InvalidSpec(format!(
                "memory_mb {} is not a sensible RAM size",
                self.memory_mb
            )));
        }
        Ok(())
    }

    /// Loads the spec from a VM directory.
    pub fn load(vm_dir: &Path) -> Result<Self, VmError> {
        let raw = fs::read_to_string(vm_dir.join(VM_SPEC_FILE))?;
        let spec: VmSpec = serde_json::from_str(&raw)?;
        spec.validate()?;
        Ok(spec)
    }

    /// Writes the spec into a VM directory, creating it if needed.
    pub fn save(&self, vm_dir: &Path) -> Result<(), VmError> {
        fs::create_dir_all(vm_dir)?;
        let raw = serde_json::to_string_pretty(self)?;
        fs::write(vm_dir.join(VM_SPEC_FILE), raw)?;
        Ok(())
    }
}
