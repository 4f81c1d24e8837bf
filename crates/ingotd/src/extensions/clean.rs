//! Cleaning protocol.
//!
//! `clean.get_clean_steps` enumerates and deduplicates the steps every
//! hardware manager is willing to run, and fingerprints the plugin set.
//! `clean.execute_clean_step` re-checks that fingerprint before dispatching
//! a step, so an agent restart with a different plugin set aborts cleaning
//! instead of running steps the enumeration never saw.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{debug, info, warn};

use ingot_hardware::HardwareRegistry;
use ingot_proto::{CleanStep, RestError};

use crate::commands::CommandRegistry;

pub struct CleanExtension {
    hardware: Arc<HardwareRegistry>,
}

impl CleanExtension {
    pub fn new(hardware: Arc<HardwareRegistry>) -> Arc<Self> {
        Arc::new(Self { hardware })
    }

    pub fn register(self: &Arc<Self>, registry: &mut CommandRegistry) {
        let ext = self.clone();
        registry.register_sync(
            "clean",
            "get_clean_steps",
            Arc::new(move |_name, params| {
                let ext = ext.clone();
                Box::pin(async move { ext.get_clean_steps(params).await })
            }),
        );

        let ext = self.clone();
        registry.register_async(
            "clean",
            "execute_clean_step",
            None,
            Arc::new(move |_name, params| {
                let ext = ext.clone();
                Box::pin(async move { ext.execute_clean_step(params).await })
            }),
        );
    }

    /// Enumerate the clean steps supported for the node and ports, one list
    /// per winning hardware manager, plus the version fingerprint the
    /// central service must echo back on every step.
    async fn get_clean_steps(&self, params: Value) -> Result<Value, RestError> {
        let node = params.get("node").cloned().unwrap_or(Value::Null);
        let ports = params.get("ports").cloned().unwrap_or(Value::Null);
        debug!(%node, %ports, "getting clean steps");

        let candidates = self
            .hardware
            .dispatch_to_all_managers("get_clean_steps", &node, &ports)
            .await?;
        let candidate_steps = parse_step_map(candidates)?;

        let support = self
            .hardware
            .dispatch_to_all_managers("evaluate_hardware_support", &node, &ports)
            .await?;
        let support: BTreeMap<String, u64> = support
            .into_iter()
            .filter_map(|(manager, value)| value.as_u64().map(|v| (manager, v)))
            .collect();

        let clean_steps = deduplicate_steps(candidate_steps, &support);
        info!(managers = clean_steps.len(), "returning clean steps");

        Ok(json!({
            "clean_steps": clean_steps,
            "hardware_manager_version": self.clean_version().await?,
        }))
    }

    /// Execute one clean step, verifying the plugin-set fingerprint first.
    async fn execute_clean_step(&self, params: Value) -> Result<Value, RestError> {
        let step = params.get("step").cloned().unwrap_or(Value::Null);
        let node = params.get("node").cloned().unwrap_or(Value::Null);
        let ports = params.get("ports").cloned().unwrap_or(Value::Null);

        if let Some(clean_version) = params.get("clean_version").filter(|v| !v.is_null()) {
            self.check_clean_version(clean_version).await?;
        }

        let step_name = step
            .get("step")
            .and_then(Value::as_str)
            .ok_or_else(|| RestError::InvalidContent {
                details: format!("malformed clean step, no 'step' key: {step}"),
            })?
            .to_string();

        info!(step = %step_name, "executing clean step");
        let result = self
            .hardware
            .dispatch_to_managers(&step_name, &node, &ports)
            .await
            .map_err(|err| RestError::Cleaning {
                details: format!("error performing clean step {step_name}: {err}"),
            })?;

        info!(step = %step_name, "clean step completed");
        // Echo the step so the central service can route the result to the
        // right driver interface.
        Ok(json!({
            "clean_result": result,
            "clean_step": step,
        }))
    }

    /// The current fingerprint: every manager's name mapped to its version.
    async fn clean_version(&self) -> Result<BTreeMap<String, String>, RestError> {
        let versions = self
            .hardware
            .dispatch_to_all_managers("get_version", &Value::Null, &Value::Null)
            .await?;
        Ok(versions
            .into_values()
            .filter_map(|version| {
                let name = version.get("name")?.as_str()?.to_string();
                let value = version.get("version")?.as_str()?.to_string();
                Some((name, value))
            })
            .collect())
    }

    /// The fingerprint supplied by the central service must match the live
    /// plugin set exactly; any drift is a retryable conflict.
    async fn check_clean_version(&self, clean_version: &Value) -> Result<(), RestError> {
        let node_version: BTreeMap<String, String> = serde_json::from_value(clean_version.clone())
            .map_err(|err| RestError::InvalidContent {
                details: format!("malformed clean_version: {err}"),
            })?;
        let agent_version = self.clean_version().await?;
        if agent_version != node_version {
            warn!(
                agent = ?agent_version,
                node = ?node_version,
                "mismatched cleaning versions"
            );
            return Err(RestError::CleanVersionMismatch {
                agent_version,
                node_version,
            });
        }
        Ok(())
    }
}

fn parse_step_map(
    candidates: BTreeMap<String, Value>,
) -> Result<BTreeMap<String, Vec<CleanStep>>, RestError> {
    candidates
        .into_iter()
        .map(|(manager, steps)| {
            let steps: Vec<CleanStep> =
                serde_json::from_value(steps).map_err(|err| RestError::CommandExecution {
                    details: format!("manager {manager} returned malformed clean steps: {err}"),
                })?;
            Ok((manager, steps))
        })
        .collect()
}

/// Remove duplicated clean steps, keyed by step name.
///
/// The winning candidate is chosen by higher hardware support, then higher
/// priority, then lexicographically smaller manager name, so the outcome is
/// a total order independent of iteration order. Steps from managers with
/// unknown support cannot be placed in that order and are dropped.
fn deduplicate_steps(
    candidate_steps: BTreeMap<String, Vec<CleanStep>>,
    support: &BTreeMap<String, u64>,
) -> BTreeMap<String, Vec<CleanStep>> {
    let mut winners: BTreeMap<String, (String, CleanStep)> = BTreeMap::new();

    for (manager, steps) in candidate_steps {
        let Some(&manager_support) = support.get(&manager) else {
            warn!(%manager, ?steps, "unknown hardware support, dropping clean steps");
            continue;
        };
        for step in steps {
            let replace = match winners.get(&step.step) {
                None => true,
                Some((held_by, held_step)) => {
                    let held_support = support.get(held_by).copied().unwrap_or(0);
                    let wins = manager_support > held_support
                        || (manager_support == held_support && step.priority > held_step.priority)
                        || (manager_support == held_support
                            && step.priority == held_step.priority
                            && manager < *held_by);
                    if wins {
                        debug!(step = %step.step, winner = %manager, "replacing duplicated clean step");
                    } else {
                        debug!(step = %step.step, "not adding duplicated clean step");
                    }
                    wins
                }
            };
            if replace {
                winners.insert(step.step.clone(), (manager.clone(), step));
            }
        }
    }

    let mut clean_steps: BTreeMap<String, Vec<CleanStep>> = BTreeMap::new();
    for (_, (manager, step)) in winners {
        clean_steps.entry(manager).or_default().push(step);
    }
    clean_steps
}
