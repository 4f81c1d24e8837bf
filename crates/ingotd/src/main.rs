//! ingotd — ingot bare-metal provisioning agent
//!
//! Boots inside the deploy ramdisk, registers the host with the central
//! provisioning service, and serves hardware commands until the host is
//! handed over to its installed OS.

use clap::Parser;
use ingotd::{Agent, AgentConfig};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AgentConfig::parse();

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("ingotd=info".parse()?))
        .init();

    info!(
        api_url = %config.api_url,
        driver = %config.driver_name,
        listen = %format!("{}:{}", config.listen_host, config.listen_port),
        standalone = config.standalone,
        "loaded configuration"
    );

    let hardware = ingot_hardware::init_global(ingot_hardware::default_managers())?;
    let agent = Agent::new(config, hardware)?;
    agent.run().await?;

    Ok(())
}
