//! Hardware manager plugins and dispatch for the ingot provisioning agent.
//!
//! A hardware manager is a plugin that reports its fitness for the booted
//! host through an integer support level and implements some subset of the
//! hardware operations. The registry discovers plugins once, orders them by
//! support level, and offers two dispatch disciplines:
//!
//! - [`HardwareRegistry::dispatch_to_managers`] — best match: the first
//!   manager in priority order that handles the method wins.
//! - [`HardwareRegistry::dispatch_to_all_managers`] — fan-out: every manager
//!   that handles the method contributes to a per-manager result map.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};

use ingot_proto::{
    BlockDevice, CleanStep, Cpu, HardwareInventory, HardwareVersion, Memory, NetworkInterface,
    RestError,
};

pub mod generic;

pub use generic::GenericHardwareManager;

// ─── Support levels ──────────────────────────────────────────────────────────

/// Guideline support levels. Larger means more specific; zero means the
/// manager cannot serve this host at all. Vendor plugins are free to return
/// values above [`support::SERVICE_PROVIDER`] to outrank everything here.
pub mod support {
    pub const NONE: u32 = 0;
    pub const GENERIC: u32 = 1;
    pub const MAINLINE: u32 = 2;
    pub const SERVICE_PROVIDER: u32 = 3;
}

// ─── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum HardwareError {
    /// Sentinel: the manager does not implement this method on this host.
    /// Dispatch catches it and falls through to the next manager.
    #[error("hardware method is not supported on this hardware")]
    Incompatible,

    #[error("no hardware managers found for this node")]
    ManagerNotFound,

    #[error("no hardware manager handled method {0}")]
    MethodNotFound(String),

    #[error("block device error: {0}")]
    BlockDevice(String),

    #[error("error erasing block device: {0}")]
    Erase(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type HardwareResult<T> = Result<T, HardwareError>;

impl From<HardwareError> for RestError {
    fn from(err: HardwareError) -> Self {
        match err {
            HardwareError::BlockDevice(details) => RestError::BlockDevice { details },
            HardwareError::Erase(details) => RestError::BlockDeviceErase { details },
            other => RestError::CommandExecution {
                details: other.to_string(),
            },
        }
    }
}

// ─── Plugin interface ────────────────────────────────────────────────────────

/// The capability interface every hardware manager implements.
///
/// Only `name` and `evaluate_hardware_support` are required. Every optional
/// operation defaults to the [`HardwareError::Incompatible`] sentinel, which
/// the dispatchers treat as "try the next manager".
#[async_trait]
pub trait HardwareManager: Send + Sync {
    /// Stable plugin name, used in result maps and as the deterministic
    /// tie-break when two managers report equal support.
    fn name(&self) -> &str;

    /// How well this manager supports the booted host; zero means not at all.
    fn evaluate_hardware_support(&self) -> u32;

    /// Version string for the clean fingerprint.
    fn version(&self) -> String {
        "1.0".to_string()
    }

    fn get_version(&self) -> HardwareVersion {
        HardwareVersion {
            name: self.name().to_string(),
            version: self.version(),
        }
    }

    async fn list_network_interfaces(&self) -> HardwareResult<Vec<NetworkInterface>> {
        Err(HardwareError::Incompatible)
    }

    /// First IPv4 address bound to the named interface, if any.
    async fn get_ipv4_addr(&self, _interface: &str) -> HardwareResult<Option<String>> {
        Err(HardwareError::Incompatible)
    }

    async fn get_cpus(&self) -> HardwareResult<Cpu> {
        Err(HardwareError::Incompatible)
    }

    async fn list_block_devices(&self) -> HardwareResult<Vec<BlockDevice>> {
        Err(HardwareError::Incompatible)
    }

    async fn get_memory(&self) -> HardwareResult<Memory> {
        Err(HardwareError::Incompatible)
    }

    async fn get_os_install_device(&self) -> HardwareResult<String> {
        Err(HardwareError::Incompatible)
    }

    async fn erase_block_device(&self, _node: &Value, _device: &BlockDevice) -> HardwareResult<()> {
        Err(HardwareError::Incompatible)
    }

    /// Erase every device that may hold user data. The default walks the
    /// manager's own block devices and erases each in turn.
    async fn erase_devices(&self, node: &Value, _ports: &Value) -> HardwareResult<Value> {
        for device in self.list_block_devices().await? {
            self.erase_block_device(node, &device).await?;
        }
        Ok(Value::Null)
    }

    /// Steps this manager is willing to run during cleaning. The step name
    /// is dispatched back into the plugin set when the step executes, so a
    /// manager that needs a step all to itself should use a unique name.
    async fn get_clean_steps(&self, _node: &Value, _ports: &Value) -> HardwareResult<Vec<CleanStep>> {
        Ok(vec![CleanStep {
            step: "erase_devices".to_string(),
            priority: 10,
            interface: "deploy".to_string(),
            reboot_requested: false,
        }])
    }

    /// Hook for plugin-specific operations not covered by the typed methods
    /// above, e.g. a vendor clean step. Dispatch falls back to this for any
    /// method name it does not recognize.
    async fn invoke_custom(
        &self,
        _method: &str,
        _node: &Value,
        _ports: &Value,
    ) -> HardwareResult<Value> {
        Err(HardwareError::Incompatible)
    }
}

fn to_value<T: serde::Serialize>(value: T) -> HardwareResult<Value> {
    serde_json::to_value(value).map_err(|e| HardwareError::Other(e.to_string()))
}

/// Route a method name to the matching operation on one manager, serializing
/// the result. Unrecognized names go through [`HardwareManager::invoke_custom`].
async fn invoke_method(
    manager: &Arc<dyn HardwareManager>,
    method: &str,
    node: &Value,
    ports: &Value,
) -> HardwareResult<Value> {
    match method {
        "evaluate_hardware_support" => to_value(manager.evaluate_hardware_support()),
        "get_version" => to_value(manager.get_version()),
        "list_network_interfaces" => to_value(manager.list_network_interfaces().await?),
        "get_cpus" => to_value(manager.get_cpus().await?),
        "list_block_devices" => to_value(manager.list_block_devices().await?),
        "get_memory" => to_value(manager.get_memory().await?),
        "get_os_install_device" => to_value(manager.get_os_install_device().await?),
        "erase_devices" => manager.erase_devices(node, ports).await,
        "get_clean_steps" => to_value(manager.get_clean_steps(node, ports).await?),
        custom => manager.invoke_custom(custom, node, ports).await,
    }
}

// ─── Registry ────────────────────────────────────────────────────────────────

/// The priority-ordered, immutable-after-discovery plugin list.
pub struct HardwareRegistry {
    managers: Vec<Arc<dyn HardwareManager>>,
}

impl HardwareRegistry {
    /// Evaluate every candidate plugin, keep the ones reporting support,
    /// and order them by (support descending, name ascending) so dispatch
    /// order is deterministic across restarts.
    pub fn discover(plugins: Vec<Arc<dyn HardwareManager>>) -> HardwareResult<Self> {
        let mut ranked: Vec<(u32, Arc<dyn HardwareManager>)> = plugins
            .into_iter()
            .map(|p| (p.evaluate_hardware_support(), p))
            .filter(|(support, _)| *support > 0)
            .collect();
        ranked.sort_by(|(sa, a), (sb, b)| sb.cmp(sa).then_with(|| a.name().cmp(b.name())));

        if ranked.is_empty() {
            return Err(HardwareError::ManagerNotFound);
        }

        for (support, manager) in &ranked {
            info!(manager = manager.name(), support, "hardware manager found");
        }

        Ok(Self {
            managers: ranked.into_iter().map(|(_, p)| p).collect(),
        })
    }

    pub fn managers(&self) -> &[Arc<dyn HardwareManager>] {
        &self.managers
    }

    /// Best-match dispatch: walk managers in priority order and return the
    /// first result that is not the incompatible sentinel. Real failures
    /// propagate immediately.
    pub async fn dispatch_to_managers(
        &self,
        method: &str,
        node: &Value,
        ports: &Value,
    ) -> HardwareResult<Value> {
        for manager in &self.managers {
            match invoke_method(manager, method, node, ports).await {
                Err(HardwareError::Incompatible) => {
                    tracing::debug!(manager = manager.name(), method, "manager does not support method");
                }
                other => return other,
            }
        }
        Err(HardwareError::MethodNotFound(method.to_string()))
    }

    /// Fan-out dispatch: collect `manager name -> result` from every manager
    /// that handles the method. Managers raising the sentinel are skipped;
    /// any other failure aborts the fan-out. An empty result map means no
    /// manager handled the method at all.
    pub async fn dispatch_to_all_managers(
        &self,
        method: &str,
        node: &Value,
        ports: &Value,
    ) -> HardwareResult<BTreeMap<String, Value>> {
        let mut responses = BTreeMap::new();
        for manager in &self.managers {
            match invoke_method(manager, method, node, ports).await {
                Ok(response) => {
                    responses.insert(manager.name().to_string(), response);
                }
                Err(HardwareError::Incompatible) => {
                    tracing::debug!(manager = manager.name(), method, "manager does not support method");
                }
                Err(err) => return Err(err),
            }
        }

        if responses.is_empty() {
            return Err(HardwareError::MethodNotFound(method.to_string()));
        }
        Ok(responses)
    }

    // ─── Typed best-match helpers ────────────────────────────────────────

    pub async fn list_network_interfaces(&self) -> HardwareResult<Vec<NetworkInterface>> {
        for manager in &self.managers {
            match manager.list_network_interfaces().await {
                Err(HardwareError::Incompatible) => continue,
                other => return other,
            }
        }
        Err(HardwareError::MethodNotFound("list_network_interfaces".to_string()))
    }

    pub async fn get_ipv4_addr(&self, interface: &str) -> HardwareResult<Option<String>> {
        for manager in &self.managers {
            match manager.get_ipv4_addr(interface).await {
                Err(HardwareError::Incompatible) => continue,
                other => return other,
            }
        }
        Err(HardwareError::MethodNotFound("get_ipv4_addr".to_string()))
    }

    pub async fn get_os_install_device(&self) -> HardwareResult<String> {
        for manager in &self.managers {
            match manager.get_os_install_device().await {
                Err(HardwareError::Incompatible) => continue,
                other => return other,
            }
        }
        Err(HardwareError::MethodNotFound("get_os_install_device".to_string()))
    }

    /// Assemble the lookup inventory payload, each category served by the
    /// best manager that implements it.
    pub async fn list_hardware_info(&self) -> HardwareResult<HardwareInventory> {
        Ok(HardwareInventory {
            interfaces: self.list_network_interfaces().await?,
            cpu: self.get_cpus().await?,
            disks: self.list_block_devices().await?,
            memory: self.get_memory().await?,
        })
    }

    async fn get_cpus(&self) -> HardwareResult<Cpu> {
        for manager in &self.managers {
            match manager.get_cpus().await {
                Err(HardwareError::Incompatible) => continue,
                other => return other,
            }
        }
        Err(HardwareError::MethodNotFound("get_cpus".to_string()))
    }

    async fn list_block_devices(&self) -> HardwareResult<Vec<BlockDevice>> {
        for manager in &self.managers {
            match manager.list_block_devices().await {
                Err(HardwareError::Incompatible) => continue,
                other => return other,
            }
        }
        Err(HardwareError::MethodNotFound("list_block_devices".to_string()))
    }

    async fn get_memory(&self) -> HardwareResult<Memory> {
        for manager in &self.managers {
            match manager.get_memory().await {
                Err(HardwareError::Incompatible) => continue,
                other => return other,
            }
        }
        Err(HardwareError::MethodNotFound("get_memory".to_string()))
    }
}

// ─── Process-level registration ──────────────────────────────────────────────

/// The compiled-in plugin set. Deployments with vendor plugins extend this
/// list before calling [`init_global`].
pub fn default_managers() -> Vec<Arc<dyn HardwareManager>> {
    vec![Arc::new(GenericHardwareManager::new())]
}

static GLOBAL: OnceLock<Arc<HardwareRegistry>> = OnceLock::new();

/// One-shot process-wide discovery. The first caller's plugin list wins;
/// later callers observe the same registry, so concurrent dispatchers always
/// see one consistent manager order.
pub fn init_global(plugins: Vec<Arc<dyn HardwareManager>>) -> HardwareResult<Arc<HardwareRegistry>> {
    if let Some(existing) = GLOBAL.get() {
        warn!("hardware registry already initialized, keeping existing plugin list");
        return Ok(existing.clone());
    }
    let registry = Arc::new(HardwareRegistry::discover(plugins)?);
    Ok(GLOBAL.get_or_init(|| registry).clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct StubManager {
        name: &'static str,
        support: u32,
        has_install_device: bool,
        fail_erase: bool,
    }

    impl StubManager {
        fn new(name: &'static str, support: u32) -> Self {
            Self {
                name,
                support,
                has_install_device: false,
                fail_erase: false,
            }
        }
    }

    #[async_trait]
    impl HardwareManager for StubManager {
        fn name(&self) -> &str {
            self.name
        }

        fn evaluate_hardware_support(&self) -> u32 {
            self.support
        }

        async fn get_os_install_device(&self) -> HardwareResult<String> {
            if self.has_install_device {
                Ok(format!("/dev/disk-{}", self.name))
            } else {
                Err(HardwareError::Incompatible)
            }
        }

        async fn erase_devices(&self, _node: &Value, _ports: &Value) -> HardwareResult<Value> {
            if self.fail_erase {
                Err(HardwareError::Erase("device is on fire".to_string()))
            } else {
                Ok(json!(format!("erased by {}", self.name)))
            }
        }
    }

    fn registry(managers: Vec<StubManager>) -> HardwareRegistry {
        HardwareRegistry::discover(
            managers
                .into_iter()
                .map(|m| Arc::new(m) as Arc<dyn HardwareManager>)
                .collect(),
        )
        .unwrap()
    }

    #[test]
    fn test_discovery_orders_by_support_then_name() {
        let reg = registry(vec![
            StubManager::new("generic", 1),
            StubManager::new("vendor", 3),
            StubManager::new("mainline", 2),
        ]);
        let names: Vec<&str> = reg.managers().iter().map(|m| m.name()).collect();
        assert_eq!(names, vec!["vendor", "mainline", "generic"]);
    }

    #[test]
    fn test_discovery_ties_break_lexicographically() {
        let reg = registry(vec![
            StubManager::new("zeta", 2),
            StubManager::new("alpha", 2),
            StubManager::new("mid", 2),
        ]);
        let names: Vec<&str> = reg.managers().iter().map(|m| m.name()).collect();
        assert_eq!(names, vec!["alpha", "mid", "zeta"]);
    }

    #[test]
    fn test_discovery_drops_unsupported_managers() {
        let reg = registry(vec![
            StubManager::new("useless", 0),
            StubManager::new("generic", 1),
        ]);
        let names: Vec<&str> = reg.managers().iter().map(|m| m.name()).collect();
        assert_eq!(names, vec!["generic"]);
    }

    #[test]
    fn test_discovery_with_no_support_fails() {
        let result = HardwareRegistry::discover(vec![
            Arc::new(StubManager::new("useless", 0)) as Arc<dyn HardwareManager>
        ]);
        assert!(matches!(result, Err(HardwareError::ManagerNotFound)));
    }

    #[tokio::test]
    async fn test_dispatch_best_match_returns_first_result() {
        let reg = registry(vec![
            StubManager::new("high", 2),
            StubManager::new("low", 1),
        ]);
        let result = reg
            .dispatch_to_managers("erase_devices", &Value::Null, &Value::Null)
            .await
            .unwrap();
        assert_eq!(result, json!("erased by high"));
    }

    #[tokio::test]
    async fn test_dispatch_skips_incompatible_managers() {
        let mut low = StubManager::new("low", 1);
        low.has_install_device = true;
        let reg = registry(vec![StubManager::new("high", 2), low]);
        // "high" raises the sentinel for get_os_install_device, "low" handles it
        let result = reg
            .dispatch_to_managers("get_os_install_device", &Value::Null, &Value::Null)
            .await
            .unwrap();
        assert_eq!(result, json!("/dev/disk-low"));
    }

    #[tokio::test]
    async fn test_dispatch_unhandled_method_fails() {
        let reg = registry(vec![StubManager::new("generic", 1)]);
        let result = reg
            .dispatch_to_managers("get_os_install_device", &Value::Null, &Value::Null)
            .await;
        assert!(matches!(result, Err(HardwareError::MethodNotFound(m)) if m == "get_os_install_device"));
    }

    #[tokio::test]
    async fn test_dispatch_propagates_real_failures() {
        let mut broken = StubManager::new("broken", 3);
        broken.fail_erase = true;
        let reg = registry(vec![broken, StubManager::new("generic", 1)]);
        let result = reg
            .dispatch_to_managers("erase_devices", &Value::Null, &Value::Null)
            .await;
        assert!(matches!(result, Err(HardwareError::Erase(_))));
    }

    #[tokio::test]
    async fn test_fan_out_collects_every_handler() {
        let reg = registry(vec![
            StubManager::new("alpha", 2),
            StubManager::new("beta", 1),
        ]);
        let responses = reg
            .dispatch_to_all_managers("erase_devices", &Value::Null, &Value::Null)
            .await
            .unwrap();
        assert_eq!(responses.len(), 2);
        assert_eq!(responses["alpha"], json!("erased by alpha"));
        assert_eq!(responses["beta"], json!("erased by beta"));
    }

    #[tokio::test]
    async fn test_fan_out_skips_sentinel_and_keys_by_handler() {
        let mut alpha = StubManager::new("alpha", 2);
        alpha.has_install_device = true;
        let reg = registry(vec![alpha, StubManager::new("beta", 1)]);
        let responses = reg
            .dispatch_to_all_managers("get_os_install_device", &Value::Null, &Value::Null)
            .await
            .unwrap();
        assert_eq!(responses.keys().collect::<Vec<_>>(), vec!["alpha"]);
    }

    #[tokio::test]
    async fn test_fan_out_with_no_handlers_fails() {
        let reg = registry(vec![StubManager::new("generic", 1)]);
        let result = reg
            .dispatch_to_all_managers("get_os_install_device", &Value::Null, &Value::Null)
            .await;
        assert!(matches!(result, Err(HardwareError::MethodNotFound(_))));
    }

    #[tokio::test]
    async fn test_fan_out_aborts_on_real_failure() {
        let mut broken = StubManager::new("broken", 1);
        broken.fail_erase = true;
        let reg = registry(vec![StubManager::new("alpha", 2), broken]);
        let result = reg
            .dispatch_to_all_managers("erase_devices", &Value::Null, &Value::Null)
            .await;
        assert!(matches!(result, Err(HardwareError::Erase(_))));
    }

    #[tokio::test]
    async fn test_default_clean_steps_and_version() {
        let reg = registry(vec![StubManager::new("generic", 1)]);
        let steps = reg
            .dispatch_to_all_managers("get_clean_steps", &json!({}), &json!([]))
            .await
            .unwrap();
        let steps: Vec<CleanStep> = serde_json::from_value(steps["generic"].clone()).unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].step, "erase_devices");
        assert_eq!(steps[0].priority, 10);

        let versions = reg
            .dispatch_to_all_managers("get_version", &Value::Null, &Value::Null)
            .await
            .unwrap();
        assert_eq!(versions["generic"]["version"], "1.0");
        assert_eq!(versions["generic"]["name"], "generic");
    }

    #[tokio::test]
    async fn test_unknown_method_falls_back_to_custom_hook() {
        struct VendorManager;

        #[async_trait]
        impl HardwareManager for VendorManager {
            fn name(&self) -> &str {
                "vendor"
            }
            fn evaluate_hardware_support(&self) -> u32 {
                support::SERVICE_PROVIDER
            }
            async fn invoke_custom(
                &self,
                method: &str,
                _node: &Value,
                _ports: &Value,
            ) -> HardwareResult<Value> {
                match method {
                    "upgrade_firmware" => Ok(json!("firmware upgraded")),
                    _ => Err(HardwareError::Incompatible),
                }
            }
        }

        let reg = HardwareRegistry::discover(vec![Arc::new(VendorManager) as _]).unwrap();
        let result = reg
            .dispatch_to_managers("upgrade_firmware", &Value::Null, &Value::Null)
            .await
            .unwrap();
        assert_eq!(result, json!("firmware upgraded"));

        let missing = reg
            .dispatch_to_managers("not_a_method", &Value::Null, &Value::Null)
            .await;
        assert!(matches!(missing, Err(HardwareError::MethodNotFound(_))));
    }
}
