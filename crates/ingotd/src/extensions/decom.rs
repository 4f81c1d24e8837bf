//! Decommission extension.
//!
//! A single long-running command that destroys user data on every device the
//! hardware managers know how to erase.

use std::sync::Arc;

use serde_json::Value;
use tracing::info;

use ingot_hardware::HardwareRegistry;
use ingot_proto::RestError;

use crate::commands::CommandRegistry;

pub struct DecomExtension {
    hardware: Arc<HardwareRegistry>,
}

impl DecomExtension {
    pub fn new(hardware: Arc<HardwareRegistry>) -> Arc<Self> {
        Arc::new(Self { hardware })
    }

    pub fn register(self: &Arc<Self>, registry: &mut CommandRegistry) {
        let ext = self.clone();
        registry.register_async(
            "decom",
            "erase_hardware",
            None,
            Arc::new(move |_name, params| {
                let ext = ext.clone();
                Box::pin(async move { ext.erase_hardware(params).await })
            }),
        );
    }

    async fn erase_hardware(&self, params: Value) -> Result<Value, RestError> {
        let node = params.get("node").cloned().unwrap_or(Value::Null);
        let ports = params.get("ports").cloned().unwrap_or(Value::Null);

        info!("erasing hardware");
        let result = self
            .hardware
            .dispatch_to_managers("erase_devices", &node, &ports)
            .await?;
        info!("hardware erased");
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use ingot_hardware::{HardwareManager, HardwareResult};
    use serde_json::json;

    struct EraseRecorder;

    #[async_trait]
    impl HardwareManager for EraseRecorder {
        fn name(&self) -> &str {
            "recorder"
        }
        fn evaluate_hardware_support(&self) -> u32 {
            1
        }
        async fn erase_devices(&self, node: &Value, _ports: &Value) -> HardwareResult<Value> {
            Ok(json!({ "erased": true, "node": node }))
        }
    }

    #[tokio::test]
    async fn test_erase_hardware_dispatches_to_best_manager() {
        let registry = HardwareRegistry::discover(vec![
            Arc::new(EraseRecorder) as Arc<dyn HardwareManager>
        ])
        .unwrap();
        let ext = DecomExtension::new(Arc::new(registry));

        let result = ext
            .erase_hardware(json!({"node": {"uuid": "n1"}, "ports": []}))
            .await
            .unwrap();
        assert_eq!(result["erased"], true);
        assert_eq!(result["node"]["uuid"], "n1");
    }
}
