//! micphone CLI: user-facing binary for the micphone audio relay.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use micphone_audio::{MixingGroup, PcmSink, SoftwareMixer};
use micphone_discovery::mdns::MdnsDiscovery;
use micphone_discovery::{DiscoveryListener, ListenerEvent};
use micphone_relay::{Config, Connectivity, LanConnectivity, Relay, RelayEvent, RelayState};
use micphone_rendezvous::{BridgeHandler, RendezvousServer, ServerEvent};
use tokio::io::AsyncWrite;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "micphone",
    about = "Relay live microphone audio from peers on the local network",
    version,
    propagate_version = true
)]
struct Cli {
    /// Path to configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay: discover the peer, accept streams, play the mix.
    Relay {
        /// Write raw PCM here instead of the configured output.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Browse for the peer relay and print where it resolves.
    Discover {
        /// Service instance name to look for.
        #[arg(long)]
        name: Option<String>,

        /// DNS-SD service type to browse.
        #[arg(long = "type")]
        service_type: Option<String>,

        /// Give up after this many seconds.
        #[arg(short, long, default_value_t = 10)]
        timeout: u64,
    },

    /// Open the rendezvous socket only and play whatever connects.
    Listen {
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Validate the configuration and check network connectivity.
    Check,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = micphone_relay::setup::load_config(cli.config.as_deref())?;

    // PCM may go to stdout, so logs always go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.relay.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Relay { output } => {
            if output.is_some() {
                config.audio.output = output;
            }
            run_relay(config).await
        }
        Commands::Discover {
            name,
            service_type,
            timeout,
        } => {
            if let Some(name) = name {
                config.discovery.service_name = name;
            }
            if let Some(service_type) = service_type {
                config.discovery.service_type = service_type;
            }
            discover(&config, Duration::from_secs(timeout)).await
        }
        Commands::Listen { output } => {
            if output.is_some() {
                config.audio.output = output;
            }
            listen(config).await
        }
        Commands::Check => check(&config),
    }
}

async fn run_relay(config: Config) -> anyhow::Result<()> {
    config.validate()?;
    let backend = MdnsDiscovery::new().context("failed to start mDNS daemon")?;
    let mixer = Arc::new(SoftwareMixer::new(config.mixer_config()));
    let (sink_stop, sink_task) = spawn_sink(&config, Arc::clone(&mixer)).await?;

    let group: Arc<dyn MixingGroup> = mixer;
    let mut relay = Relay::new(config, backend, group, LanConnectivity::default());
    let events = relay.event_sender();
    let mut status = relay.status_receiver();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = events.send(RelayEvent::Shutdown).await;
        }
    });
    tokio::spawn(async move {
        let mut last_port = None;
        let mut last_peer = None;
        while status.changed().await.is_ok() {
            let status = status.borrow_and_update().clone();
            if status.port != last_port {
                if let Some(port) = status.port {
                    eprintln!("Rendezvous port: {port}");
                }
                last_port = status.port;
            }
            if status.resolved != last_peer {
                if let Some(addr) = status.resolved.as_ref().and_then(|r| r.socket_addr()) {
                    eprintln!("Peer relay: {addr}");
                }
                last_peer = status.resolved;
            }
            if status.state == RelayState::Stopped {
                break;
            }
        }
    });

    let result = relay.run().await;
    let _ = sink_stop.send(true);
    let frames = sink_task.await??;
    tracing::debug!(frames, "mix output closed");
    Ok(result?)
}

async fn discover(config: &Config, timeout: Duration) -> anyhow::Result<()> {
    config.validate()?;
    let backend = MdnsDiscovery::new().context("failed to start mDNS daemon")?;
    let target = config.discovery_target();
    tracing::info!(
        service_name = %target.service_name,
        service_type = %target.service_type,
        "browsing"
    );
    let (mut listener, mut events) = DiscoveryListener::new(backend, target);
    listener.start().await;

    let outcome = tokio::time::timeout(timeout, async {
        while let Some(event) = events.recv().await {
            match event {
                ListenerEvent::Resolved(record) => return Ok(Some(record)),
                ListenerEvent::Failed(e) if e.kind().is_some_and(|k| k.is_fatal()) => {
                    return Err(e);
                }
                ListenerEvent::Failed(e) => tracing::warn!(error = %e, "resolution failed"),
                _ => {}
            }
        }
        Ok(None)
    })
    .await;
    listener.stop().await;

    match outcome {
        Ok(Ok(Some(record))) => {
            println!("{record}");
            Ok(())
        }
        Ok(Ok(None)) => anyhow::bail!("discovery ended without a result"),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => anyhow::bail!("no peer relay found within {}s", timeout.as_secs()),
    }
}

async fn listen(config: Config) -> anyhow::Result<()> {
    config.validate()?;
    let mixer = Arc::new(SoftwareMixer::new(config.mixer_config()));
    let (sink_stop, sink_task) = spawn_sink(&config, Arc::clone(&mixer)).await?;

    let handler = Arc::new(BridgeHandler::new(mixer));
    let (server, mut events) = RendezvousServer::start(config.rendezvous_config()?, handler.clone())?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Some(ServerEvent::Listening(port)) => eprintln!("Rendezvous port: {port}"),
                Some(ServerEvent::SessionStarted { remote, .. }) => eprintln!("Connected: {remote}"),
                Some(ServerEvent::SessionEnded { remote, .. }) => eprintln!("Disconnected: {remote}"),
                Some(ServerEvent::BridgeFailed { remote, error, .. }) => {
                    tracing::warn!(remote = %remote, error = %error, "connection dropped");
                }
                Some(ServerEvent::Faulted(e)) => return Err(e.into()),
                Some(ServerEvent::Stopped) | None => break,
            },
        }
    }

    tokio::task::spawn_blocking(move || server.tear_down()).await?;
    handler.detach_all();
    let _ = sink_stop.send(true);
    sink_task.await??;
    Ok(())
}

fn check(config: &Config) -> anyhow::Result<()> {
    config.validate()?;
    print!("{}", toml::to_string_pretty(config)?);
    let online = LanConnectivity::default().is_available();
    eprintln!(
        "Network: {}",
        if online { "available" } else { "unavailable" }
    );
    Ok(())
}

type SinkTask = tokio::task::JoinHandle<Result<u64, micphone_audio::AudioError>>;

async fn spawn_sink(
    config: &Config,
    mixer: Arc<SoftwareMixer>,
) -> anyhow::Result<(watch::Sender<bool>, SinkTask)> {
    let out: Box<dyn AsyncWrite + Unpin + Send> = match &config.audio.output {
        Some(path) => Box::new(
            tokio::fs::File::create(path)
                .await
                .with_context(|| format!("failed to create {}", path.display()))?,
        ),
        None => Box::new(tokio::io::stdout()),
    };
    let sink = PcmSink::new(mixer, config.sink_config());
    let (stop_tx, stop_rx) = watch::channel(false);
    let task = tokio::spawn(async move { sink.run(out, stop_rx).await });
    Ok((stop_tx, task))
}
