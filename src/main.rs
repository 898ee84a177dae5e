use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

use sim_relay::config::RelayConfig;
use sim_relay::install::Installation;
use sim_relay::jobs::LocalScheduler;
use sim_relay::relay::ConnectionAcceptor;
use sim_relay::relay::profile::PROFILE_TARGET;
use sim_relay::transport::LocalTransport;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let console_layer = fmt::layer().with_target(false).with_filter(
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    );

    // Optional profiling sink: one JSON line per completed call, appended to
    // the file named by SIM_RELAY_PROFILE.
    let mut _profile_guard = None;
    let profile_layer = match std::env::var("SIM_RELAY_PROFILE") {
        Ok(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)?;
            let (writer, guard) = tracing_appender::non_blocking(file);
            _profile_guard = Some(guard);
            Some(
                fmt::layer()
                    .with_writer(writer)
                    .with_ansi(false)
                    .with_target(false)
                    .with_filter(tracing_subscriber::filter::filter_fn(|meta| {
                        meta.target() == PROFILE_TARGET
                    })),
            )
        }
        Err(_) => None,
    };

    tracing_subscriber::registry()
        .with(console_layer)
        .with(profile_layer)
        .init();

    let mut config = RelayConfig::default();
    if let Ok(addr) = std::env::var("SIM_RELAY_LISTEN") {
        config.listen_addr = addr;
    }

    // Installation home: descriptor lookups plus the base for relative
    // worker executables.
    let home: Option<PathBuf> = match std::env::var("SIM_RELAY_HOME") {
        Ok(home) => {
            let install = Installation::load(Path::new(&home))?;
            tracing::info!(
                home = %install.home().display(),
                mpiexec = install.mpiexec_enabled().unwrap_or(false),
                "installation descriptor loaded"
            );
            Some(install.home().to_path_buf())
        }
        Err(_) => None,
    };

    let transport = Arc::new(LocalTransport::new());
    let scheduler = Arc::new(LocalScheduler::new(home));

    let acceptor = ConnectionAcceptor::bind(config, transport, scheduler).await?;
    acceptor.run().await?;

    Ok(())
}
