//! Agent configuration
//!
//! Every knob is a CLI flag with an `INGOT_*` environment fallback, so the
//! deploy ramdisk can feed the agent from kernel parameters, cloud-init, or a
//! systemd unit without caring which.

use clap::Parser;

/// Configuration for the ingotd provisioning agent.
#[derive(Parser, Debug, Clone)]
#[command(name = "ingotd", about = "ingot bare-metal provisioning agent", version)]
pub struct AgentConfig {
    /// Base URL of the central provisioning service
    #[arg(long, env = "INGOT_API_URL", default_value = "http://127.0.0.1:6385")]
    pub api_url: String,

    /// Host to advertise to the central service; discovered from a network
    /// interface when unset
    #[arg(long, env = "INGOT_ADVERTISE_HOST")]
    pub advertise_host: Option<String>,

    /// Port the central service should call back on
    #[arg(long, env = "INGOT_ADVERTISE_PORT", default_value_t = 9999)]
    pub advertise_port: u16,

    /// Address the HTTP surface binds to
    #[arg(long, env = "INGOT_LISTEN_HOST", default_value = "0.0.0.0")]
    pub listen_host: String,

    #[arg(long, env = "INGOT_LISTEN_PORT", default_value_t = 9999)]
    pub listen_port: u16,

    /// Rounds of interface polling before giving up on IP discovery
    #[arg(long, env = "INGOT_IP_LOOKUP_ATTEMPTS", default_value_t = 3)]
    pub ip_lookup_attempts: u32,

    /// Seconds to sleep between IP discovery rounds
    #[arg(long, env = "INGOT_IP_LOOKUP_SLEEP", default_value_t = 10.0)]
    pub ip_lookup_sleep: f64,

    /// Restrict IP discovery to a single interface
    #[arg(long, env = "INGOT_NETWORK_INTERFACE")]
    pub network_interface: Option<String>,

    /// Overall node lookup deadline, in seconds
    #[arg(long, env = "INGOT_LOOKUP_TIMEOUT", default_value_t = 300)]
    pub lookup_timeout: u64,

    /// Starting retry interval for node lookup, in seconds
    #[arg(long, env = "INGOT_LOOKUP_INTERVAL", default_value_t = 1)]
    pub lookup_interval: u64,

    /// Driver that routes the lookup on the central service
    #[arg(long, env = "INGOT_DRIVER_NAME", default_value = "agent_ipmitool")]
    pub driver_name: String,

    /// Serve the HTTP surface without looking up a node or heartbeating
    #[arg(long, env = "INGOT_STANDALONE")]
    pub standalone: bool,
}
