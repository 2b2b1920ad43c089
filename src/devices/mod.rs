//! Device plugins: the narrow contract the controller uses to stay
//! hardware-agnostic. A device's name is opaque to the core; configs
//! reference devices purely by that string.

mod cpu;

pub use cpu::CpuDevice;

use std::collections::HashMap;

/// (total_mb, available_mb, used_mb)
#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryInfo {
    pub total_mb: u64,
    pub available_mb: u64,
    pub used_mb: u64,
}

/// One instance per device class. Implementations must not block for more
/// than O(10ms) typical; transient errors are mapped to `is_online == false`
/// and zeroed memory rather than propagated.
pub trait DevicePlugin: Send + Sync {
    fn device_name(&self) -> &str;
    fn is_online(&self) -> bool;
    fn memory_info(&self) -> MemoryInfo;
}

/// Built once at startup from the configured plugin set, never mutated
/// afterward. When GPU monitoring is disabled, only the CPU device (or no
/// devices at all) is registered, so any variant requiring a GPU device name
/// simply never qualifies at adaptive-config selection time (see
/// `crate::config::ConfigManager::adaptive_config`).
pub struct DeviceRegistry {
    plugins: HashMap<String, Box<dyn DevicePlugin>>,
}

impl DeviceRegistry {
    pub fn new(plugins: Vec<Box<dyn DevicePlugin>>) -> Self {
        let mut map = HashMap::new();
        for plugin in plugins {
            map.insert(plugin.device_name().to_string(), plugin);
        }
        Self { plugins: map }
    }

    /// The default registry: just the built-in CPU device.
    pub fn default_registry() -> Self {
        Self::new(vec![Box::new(CpuDevice::default())])
    }

    pub fn online_devices(&self) -> std::collections::HashSet<String> {
        self.plugins
            .values()
            .filter(|p| p.is_online())
            .map(|p| p.device_name().to_string())
            .collect()
    }

    pub fn memory_info(&self, device_name: &str) -> Option<MemoryInfo> {
        self.plugins.get(device_name).map(|p| p.memory_info())
    }

    pub fn is_online(&self, device_name: &str) -> bool {
        self.plugins.get(device_name).map(|p| p.is_online()).unwrap_or(false)
    }
}
