//! Test-support extension.
//!
//! A deliberately trivial async command used by the functional tests to
//! exercise the full command path without touching hardware. Never
//! registered by the production binary.

use std::sync::Arc;

use serde_json::{json, Value};

use ingot_proto::RestError;

use crate::commands::CommandRegistry;

pub struct FakeExtension;

impl FakeExtension {
    pub fn register(registry: &mut CommandRegistry) {
        registry.register_async(
            "FAKE",
            "do_something",
            None,
            Arc::new(|_name, params| {
                Box::pin(async move {
                    if params.get("fail").and_then(Value::as_bool).unwrap_or(false) {
                        Err(RestError::CommandExecution {
                            details: "command execution failed".to_string(),
                        })
                    } else {
                        Ok(json!("command execution succeeded"))
                    }
                })
            }),
        );
    }
}
