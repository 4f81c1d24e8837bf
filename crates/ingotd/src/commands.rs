//! Command registry and asynchronous result store.
//!
//! Extensions register `(extension, command, mode, validator?, handler)`
//! entries at construction; requests name commands as `extension.command`.
//! Synchronous commands run on the caller's task and come back terminal;
//! asynchronous commands return a RUNNING record immediately and complete on
//! a background task. Records are retained indefinitely so the central
//! service can poll them by id.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, error, info};
use uuid::Uuid;

use ingot_proto::{CommandResult, RestError};

pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Value, RestError>> + Send>>;

/// A command handler receives its own full name plus the params mapping.
pub type CommandHandler = Arc<dyn Fn(String, Value) -> HandlerFuture + Send + Sync>;

/// Validators run before an async command is enqueued and may reject the
/// params with an invalid-content error.
pub type CommandValidator = Arc<dyn Fn(&Value) -> Result<(), RestError> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExecutionMode {
    Sync,
    Async,
}

struct CommandSpec {
    extension: String,
    mode: ExecutionMode,
    validator: Option<CommandValidator>,
    handler: CommandHandler,
}

// ─── Result store ────────────────────────────────────────────────────────────

/// Shared store of command records plus the per-extension async slot.
///
/// Insertion order is retained so `list` reflects the order commands were
/// accepted. Updates happen under the mutex, so a status read never observes
/// a half-written record.
#[derive(Default)]
pub struct CommandStore {
    results: Mutex<Vec<CommandResult>>,
    running: Mutex<HashMap<String, Uuid>>,
}

impl CommandStore {
    fn insert(&self, record: CommandResult) {
        self.results.lock().push(record);
    }

    fn complete(&self, id: Uuid, outcome: Result<Value, RestError>) {
        let mut results = self.results.lock();
        if let Some(record) = results.iter_mut().find(|r| r.id == id) {
            record.complete(outcome);
        }
    }

    /// Reserve the async slot for an extension. Fails when a command is
    /// already running there.
    fn reserve(&self, extension: &str, id: Uuid) -> Result<(), RestError> {
        let mut running = self.running.lock();
        if let Some(existing) = running.get(extension) {
            return Err(RestError::CommandBusy {
                details: format!(
                    "extension {extension} is already running command {existing}"
                ),
            });
        }
        running.insert(extension.to_string(), id);
        Ok(())
    }

    fn release(&self, extension: &str) {
        self.running.lock().remove(extension);
    }

    pub fn list(&self) -> Vec<CommandResult> {
        self.results.lock().clone()
    }

    pub fn get(&self, id: Uuid) -> Result<CommandResult, RestError> {
        self.results
            .lock()
            .iter()
            .find(|r| r.id == id)
            .cloned()
            .ok_or_else(|| RestError::not_found("Command Result", id))
    }
}

// ─── Registry ────────────────────────────────────────────────────────────────

/// All commands known to this agent, keyed `extension.command`. Immutable
/// once the agent starts serving.
pub struct CommandRegistry {
    commands: HashMap<String, CommandSpec>,
    store: Arc<CommandStore>,
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self {
            commands: HashMap::new(),
            store: Arc::new(CommandStore::default()),
        }
    }

    pub fn store(&self) -> &Arc<CommandStore> {
        &self.store
    }

    pub fn register_sync(&mut self, extension: &str, command: &str, handler: CommandHandler) {
        self.register(extension, command, ExecutionMode::Sync, None, handler);
    }

    pub fn register_async(
        &mut self,
        extension: &str,
        command: &str,
        validator: Option<CommandValidator>,
        handler: CommandHandler,
    ) {
        self.register(extension, command, ExecutionMode::Async, validator, handler);
    }

    fn register(
        &mut self,
        extension: &str,
        command: &str,
        mode: ExecutionMode,
        validator: Option<CommandValidator>,
        handler: CommandHandler,
    ) {
        let name = format!("{extension}.{command}");
        debug!(command = %name, "registering command");
        self.commands.insert(
            name,
            CommandSpec {
                extension: extension.to_string(),
                mode,
                validator,
                handler,
            },
        );
    }

    /// Execute a named command. The returned record is terminal for sync
    /// commands and RUNNING for async ones; sync handler failures come back
    /// as the error itself, with the failed record still stored for polling.
    pub async fn execute(
        &self,
        command_name: &str,
        params: Value,
    ) -> Result<CommandResult, RestError> {
        if !command_name.contains('.') {
            return Err(RestError::InvalidCommand {
                details: format!(
                    "command name must have the form extension.command, got {command_name}"
                ),
            });
        }
        let spec = self.commands.get(command_name).ok_or_else(|| {
            RestError::InvalidCommand {
                details: format!("unknown command: {command_name}"),
            }
        })?;

        if let Some(validator) = &spec.validator {
            validator(&params)?;
        }

        let mut record = CommandResult::running(command_name, params.clone());

        match spec.mode {
            ExecutionMode::Sync => {
                let outcome = (spec.handler)(command_name.to_string(), params).await;
                let failure = outcome.as_ref().err().cloned();
                record.complete(outcome);
                self.store.insert(record.clone());
                match failure {
                    Some(err) => Err(err),
                    None => Ok(record),
                }
            }
            ExecutionMode::Async => {
                self.store.reserve(&spec.extension, record.id)?;
                self.store.insert(record.clone());

                let store = self.store.clone();
                let handler = spec.handler.clone();
                let extension = spec.extension.clone();
                let name = command_name.to_string();
                let id = record.id;
                tokio::spawn(async move {
                    let outcome = handler(name.clone(), params).await;
                    match &outcome {
                        Ok(_) => info!(command = %name, %id, "async command succeeded"),
                        Err(err) => error!(command = %name, %id, error = %err, "async command failed"),
                    }
                    store.complete(id, outcome);
                    store.release(&extension);
                });

                Ok(record)
            }
        }
    }
}
