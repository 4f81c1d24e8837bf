//! Agent coordinator.
//!
//! Owns the command registry, the heartbeater, and the HTTP listener.
//! Startup order matters: resolve the advertise address, look the node up,
//! bind the listener, and only then start heartbeating. The central service
//! must never hear from an agent it cannot call back.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::Value;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::info;
use uuid::Uuid;

use ingot_client::{ApiClient, ApiError, HeartbeatApi};
use ingot_hardware::{HardwareError, HardwareRegistry};
use ingot_proto::{AgentStatus, CommandResult, RestError};

use crate::commands::CommandRegistry;
use crate::config::AgentConfig;
use crate::extensions::clean::CleanExtension;
use crate::extensions::decom::DecomExtension;
use crate::extensions::standby::StandbyExtension;
use crate::heartbeat::Heartbeater;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// The agent has not completed a node lookup yet; heartbeats are blocked
/// until it has. Internal sentinel, never serialized.
#[derive(Debug, Error)]
#[error("agent is not associated with a node")]
pub struct UnknownNodeError;

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("agent could not find a valid network interface")]
    LookupAgentInterface,

    #[error("agent could not find a valid IP address")]
    LookupAgentIp,

    #[error(transparent)]
    UnknownNode(#[from] UnknownNodeError),

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error(transparent)]
    Hardware(#[from] HardwareError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

pub struct Agent {
    config: AgentConfig,
    hardware: Arc<HardwareRegistry>,
    api_client: Arc<ApiClient>,
    registry: CommandRegistry,
    started_at: DateTime<Utc>,
    node: RwLock<Option<Value>>,
    heartbeat_timeout: RwLock<Option<f64>>,
    advertise_host: RwLock<Option<String>>,
    network_interface: RwLock<Option<String>>,
    heartbeater: tokio::sync::Mutex<Option<Heartbeater>>,
}

impl Agent {
    pub fn new(
        config: AgentConfig,
        hardware: Arc<HardwareRegistry>,
    ) -> Result<Arc<Self>, StartupError> {
        Self::with_extra_commands(config, hardware, |_| {})
    }

    /// Construct the agent with additional commands registered, e.g. the
    /// fake extension in functional tests.
    pub fn with_extra_commands(
        config: AgentConfig,
        hardware: Arc<HardwareRegistry>,
        extra: impl FnOnce(&mut CommandRegistry),
    ) -> Result<Arc<Self>, StartupError> {
        let api_client = Arc::new(ApiClient::new(&config.api_url, &config.driver_name)?);

        let mut registry = CommandRegistry::new();
        CleanExtension::new(hardware.clone()).register(&mut registry);
        StandbyExtension::new(hardware.clone()).register(&mut registry);
        DecomExtension::new(hardware.clone()).register(&mut registry);
        extra(&mut registry);

        let advertise_host = config.advertise_host.clone();
        let network_interface = config.network_interface.clone();

        Ok(Arc::new(Self {
            config,
            hardware,
            api_client,
            registry,
            started_at: Utc::now(),
            node: RwLock::new(None),
            heartbeat_timeout: RwLock::new(None),
            advertise_host: RwLock::new(advertise_host),
            network_interface: RwLock::new(network_interface),
            heartbeater: tokio::sync::Mutex::new(None),
        }))
    }

    pub fn get_status(&self) -> AgentStatus {
        AgentStatus {
            started_at: self.started_at,
            version: VERSION.to_string(),
        }
    }

    /// UUID of the node this agent serves. Unknown until lookup completes.
    pub fn node_uuid(&self) -> Result<String, UnknownNodeError> {
        self.node
            .read()
            .as_ref()
            .and_then(|node| node.get("uuid"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or(UnknownNodeError)
    }

    /// The callback URL advertised to the central service.
    pub fn agent_url(&self) -> Result<String, StartupError> {
        let host = self
            .advertise_host
            .read()
            .clone()
            .ok_or(StartupError::LookupAgentIp)?;
        Ok(format!("http://{host}:{}", self.config.advertise_port))
    }

    pub fn network_interface(&self) -> Option<String> {
        self.network_interface.read().clone()
    }

    // ─── Command registry passthrough ────────────────────────────────────

    pub async fn execute_command(
        &self,
        name: &str,
        params: Value,
    ) -> Result<CommandResult, RestError> {
        self.registry.execute(name, params).await
    }

    pub fn list_command_results(&self) -> Vec<CommandResult> {
        self.registry.store().list()
    }

    pub fn get_command_result(&self, id: Uuid) -> Result<CommandResult, RestError> {
        self.registry.store().get(id)
    }

    pub async fn force_heartbeat(&self) {
        if let Some(heartbeater) = self.heartbeater.lock().await.as_ref() {
            heartbeater.force_heartbeat();
        }
    }

    // ─── Advertise address discovery ─────────────────────────────────────

    /// Find an advertise IP if none was configured. Polls each candidate
    /// interface for an IPv4 address, several rounds with a sleep between,
    /// because the ramdisk may still be negotiating DHCP.
    pub async fn set_agent_advertise_addr(&self) -> Result<(), StartupError> {
        if self.advertise_host.read().is_some() {
            return Ok(());
        }

        let interfaces = match self.network_interface.read().clone() {
            Some(interface) => vec![interface],
            None => self.agent_network_interfaces().await?,
        };

        for _attempt in 0..self.config.ip_lookup_attempts {
            for interface in &interfaces {
                if let Some(ip) = self.hardware.get_ipv4_addr(interface).await? {
                    info!(interface = %interface, ip = %ip, "resolved advertise address");
                    *self.advertise_host.write() = Some(ip);
                    *self.network_interface.write() = Some(interface.clone());
                    return Ok(());
                }
            }
            tokio::time::sleep(Duration::from_secs_f64(self.config.ip_lookup_sleep)).await;
        }

        Err(StartupError::LookupAgentIp)
    }

    /// All physical interface names, loopbacks excluded.
    async fn agent_network_interfaces(&self) -> Result<Vec<String>, StartupError> {
        let names: Vec<String> = self
            .hardware
            .list_network_interfaces()
            .await?
            .into_iter()
            .map(|interface| interface.name)
            .filter(|name| !name.contains("lo"))
            .collect();

        if names.is_empty() {
            return Err(StartupError::LookupAgentInterface);
        }
        Ok(names)
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────

    /// Resolve the advertise address and look the node up. In standalone
    /// mode both are skipped and the agent only serves its HTTP surface.
    pub async fn startup(&self) -> Result<(), StartupError> {
        if self.config.standalone {
            info!("standalone mode: skipping node lookup and heartbeat");
            return Ok(());
        }

        self.set_agent_advertise_addr().await?;

        let inventory = self.hardware.list_hardware_info().await?;
        let content = self
            .api_client
            .lookup_node(
                &inventory,
                Duration::from_secs(self.config.lookup_timeout),
                Duration::from_secs(self.config.lookup_interval),
            )
            .await?;

        info!(heartbeat_timeout = content.heartbeat_timeout, "node lookup complete");
        *self.node.write() = Some(content.node);
        *self.heartbeat_timeout.write() = Some(content.heartbeat_timeout);
        Ok(())
    }

    /// Serve the HTTP surface until `shutdown` resolves, heartbeating in the
    /// background. The heartbeater starts only once the listener is bound
    /// and the node is known, and is stopped on the way out.
    pub async fn serve(
        self: &Arc<Self>,
        listener: TcpListener,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> Result<(), StartupError> {
        if !self.config.standalone {
            let node_uuid = self.node_uuid()?;
            let agent_url = self.agent_url()?;
            let heartbeat_timeout = (*self.heartbeat_timeout.read()).ok_or(UnknownNodeError)?;
            let api: Arc<dyn HeartbeatApi> = self.api_client.clone();
            *self.heartbeater.lock().await = Some(Heartbeater::start(
                api,
                node_uuid,
                agent_url,
                heartbeat_timeout,
            ));
        }

        let router = crate::api::router(self.clone());
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await?;

        if let Some(mut heartbeater) = self.heartbeater.lock().await.take() {
            heartbeater.stop().await;
        }
        Ok(())
    }

    /// Full agent lifecycle: startup, bind, serve until ctrl-c.
    pub async fn run(self: &Arc<Self>) -> Result<(), StartupError> {
        info!(version = VERSION, "starting agent");
        self.startup().await?;

        let listener = TcpListener::bind((self.config.listen_host.as_str(), self.config.listen_port))
            .await?;
        info!(addr = %listener.local_addr()?, "agent API listening");

        self.serve(listener, shutdown_signal()).await
    }
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}
