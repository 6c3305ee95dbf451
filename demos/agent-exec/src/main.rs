//! Run one agent and print its events as server-sent event frames.
//!
//! Run with: cargo run -p agent-exec -- <agent_id> <input> [timeout_secs]
//!
//! The binary and team configuration come from `CAGENT_BIN` and
//! `CAGENT_TEAM_CONFIG`.

use std::{io::Write, time::Duration};

use agent_sidecar_core::ExecuteRequest;
use agent_sidecar_executor::{Supervisor, SupervisorConfig};
use agent_sidecar_session::SessionManager;
use anyhow::{Context, bail};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let (Some(agent_id), Some(input)) = (args.next(), args.next()) else {
        bail!("usage: agent-exec <agent_id> <input> [timeout_secs]");
    };

    let config = SupervisorConfig::from_env();
    let timeout = match args.next() {
        Some(secs) => Duration::from_secs(secs.parse().context("timeout must be whole seconds")?),
        None => config.default_timeout,
    };
    let request = ExecuteRequest::new(agent_id, input).with_timeout(timeout);

    let supervisor = Supervisor::new(config)
        .await
        .context("failed to initialize supervisor")?;
    tracing::info!(version = %supervisor.version(), "supervisor ready");

    let manager = SessionManager::new(supervisor);
    let session_id = manager.start(request).context("failed to start execution")?;
    let mut subscription = manager.subscribe(session_id);

    let mut stdout = std::io::stdout().lock();
    tokio::select! {
        () = async {
            while let Some(item) = subscription.next().await {
                if write!(stdout, "{}", item.to_sse_frame()).and_then(|()| stdout.flush()).is_err() {
                    break;
                }
            }
        } => {}
        _ = tokio::signal::ctrl_c() => tracing::info!("interrupted"),
    }

    manager.shutdown().await;
    Ok(())
}
