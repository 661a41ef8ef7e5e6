//! agentmesh - run one agent on the mesh until interrupted.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

use agentmesh_agent::{AgentConfig, AgentRuntime, HandlerContext};
use agentmesh_protocol::{AgentResponseParams, MessageEnvelope, MessageType, Payload};
use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "agentmesh", version, about = "Agent discovery and messaging node")]
struct Cli {
    /// TOML config file. Defaults to `<config dir>/agentmesh/config.toml` if present.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    agent_id: Option<String>,

    /// Capability tag to advertise. Repeatable.
    #[arg(long = "capability", value_name = "TAG")]
    capabilities: Vec<String>,

    /// Multiaddr to listen on, e.g. /ip4/0.0.0.0/tcp/4001.
    #[arg(long)]
    listen: Option<String>,

    /// Peer multiaddr to dial at startup. Repeatable.
    #[arg(long = "bootstrap", value_name = "MULTIADDR")]
    bootstrap: Vec<String>,

    #[arg(long)]
    no_mdns: bool,
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir()
        .map(|dir| dir.join("agentmesh").join("config.toml"))
        .filter(|path| path.exists())
}

fn load_config(cli: &Cli) -> anyhow::Result<AgentConfig> {
    let mut config = match cli.config.clone().or_else(default_config_path) {
        Some(path) => AgentConfig::load(&path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => AgentConfig::default(),
    };
    if let Some(id) = &cli.agent_id {
        config.agent.id = Some(id.clone());
    }
    config.agent.capabilities.extend(cli.capabilities.iter().cloned());
    if let Some(listen) = &cli.listen {
        config.transport.listen_addr = listen.clone();
    }
    config.transport.bootstrap_peers.extend(cli.bootstrap.iter().cloned());
    if cli.no_mdns {
        config.transport.mdns = false;
    }
    config.validate()?;
    Ok(config)
}

/// Answer help requests this agent can cover.
fn answer_help_wanted(
    advertised: &BTreeSet<String>,
    envelope: &MessageEnvelope,
    ctx: &HandlerContext,
) -> anyhow::Result<()> {
    let Payload::HelpWanted(request) = &envelope.payload else {
        return Ok(());
    };
    tracing::info!(from = %envelope.source, description = %request.description, "Help wanted");
    let missing: Vec<&String> = request
        .required_capabilities
        .difference(advertised)
        .collect();
    if !missing.is_empty() {
        tracing::debug!(?missing, "Cannot help, capabilities missing");
        return Ok(());
    }
    ctx.reply(envelope, AgentResponseParams::reply_to(envelope, "available"))?;
    Ok(())
}

fn log_message(envelope: &MessageEnvelope, _ctx: &HandlerContext) -> anyhow::Result<()> {
    match &envelope.payload {
        Payload::SimpleMessage(message) => {
            tracing::info!(from = %envelope.source, content = %message.content, "Message");
        }
        _ => {
            tracing::info!(from = %envelope.source, kind = %envelope.kind, "Unhandled envelope");
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    let advertised: BTreeSet<String> = config
        .agent
        .capabilities
        .iter()
        .chain(&config.agent.specializations)
        .cloned()
        .collect();

    let runtime = AgentRuntime::builder(config)
        .handler(
            MessageType::HelpWanted,
            move |envelope: &MessageEnvelope, ctx: &HandlerContext| -> anyhow::Result<()> {
                answer_help_wanted(&advertised, envelope, ctx)
            },
        )
        .default_handler(log_message)
        .start()
        .await
        .context("starting agent runtime")?;

    tracing::info!(agent = %runtime.agent_id(), "Running; press Ctrl-C to stop");

    let mut report = tokio::time::interval(Duration::from_secs(60));
    report.tick().await;
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("waiting for Ctrl-C")?;
                break;
            }
            _ = report.tick() => {
                match runtime.network_stats(Duration::from_secs(300)).await {
                    Ok(stats) => tracing::info!(
                        agents = stats.total_agents,
                        idle = stats.idle_agents,
                        busy = stats.busy_agents,
                        messages = stats.total_messages,
                        "Network stats"
                    ),
                    Err(e) => tracing::warn!(error = %e, "Network stats unavailable"),
                }
            }
        }
    }

    let report = runtime.shutdown().await?;
    tracing::info!(
        withdrawn = report.withdrawn,
        abandoned_work = report.abandoned_work,
        abandoned_writes = report.abandoned_writes,
        abandoned_buffered = report.abandoned_buffered,
        "Shut down"
    );
    Ok(())
}
