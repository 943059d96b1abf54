//! Cluster membership daemon.
//!
//! Registers this node as a service instance, watches its peers, contends
//! for the leader lock and logs every membership and leadership change
//! until interrupted.

use anyhow::Context;
use clap::Parser;
use contiv_objdb::{
    DistributedLock, LockEvent, ObjdbClient, ObjdbConfig, PluginRegistry, ServiceInfo,
    WatchEventType, WatchServiceEvent,
};
use std::future::Future;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

const PEER_QUEUE_CAPACITY: usize = 64;

/// Contiv cluster store membership daemon
#[derive(Parser, Debug)]
#[command(name = "objdbd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file (TOML); defaults apply when absent
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Cluster store URL, e.g. etcd://127.0.0.1:2379 or consul://127.0.0.1:8500
    #[arg(short = 's', long)]
    store_url: Option<String>,

    /// Name this node registers under
    #[arg(long, default_value = "netplugin")]
    service_name: String,

    /// Address peers reach this node at
    #[arg(long, default_value = "127.0.0.1")]
    host_addr: String,

    /// Port peers reach this node at
    #[arg(short = 'p', long, default_value = "9001")]
    port: u16,

    /// Hostname published with the registration
    #[arg(long, default_value = "")]
    hostname: String,

    /// Leader lock name
    #[arg(long, default_value = "netmaster/leader")]
    lock_name: String,

    /// Holder ID for the leader lock, `<host-addr>:<port>` when unset
    #[arg(long)]
    holder_id: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn holder_id(&self) -> String {
        self.holder_id
            .clone()
            .unwrap_or_else(|| format!("{}:{}", self.host_addr, self.port))
    }

    /// Effective configuration: file (or defaults), then command line
    /// overrides.
    fn load_config(&self) -> anyhow::Result<ObjdbConfig> {
        let mut config = match &self.config {
            Some(path) => ObjdbConfig::load_or_default(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => ObjdbConfig::default(),
        };
        if let Some(url) = &self.store_url {
            config.store.url = url.clone();
        }
        config.validate().context("invalid configuration")?;
        Ok(config)
    }

    fn service_info(&self, config: &ObjdbConfig) -> ServiceInfo {
        ServiceInfo::new(
            &self.service_name,
            &self.host_addr,
            self.port,
            config.service.ttl_secs,
        )
        .with_hostname(&self.hostname)
    }
}

fn init_logging(level: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .with_context(|| format!("invalid log level '{}'", level))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .compact()
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to set logger: {}", e))
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    if let Err(e) = init_logging(&args.log_level) {
        eprintln!("objdbd: {:#}", e);
        return ExitCode::FAILURE;
    }

    info!("objdbd: Starting cluster membership daemon");
    match run(args).await {
        Ok(()) => {
            info!("objdbd: Daemon exiting normally");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %format!("{:#}", e), "objdbd: Daemon exiting with error");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let config = args.load_config()?;
    info!(url = %config.store.url, service = %args.service_name, "Loaded configuration");

    let client = PluginRegistry::with_builtin()
        .new_client(&config.store.url, &config)
        .await
        .context("connecting to cluster store")?;

    let info = args.service_info(&config);
    client
        .register_service(info.clone())
        .await
        .context("registering service")?;

    let watch_stop = CancellationToken::new();
    let (peer_tx, mut peers) = mpsc::channel(PEER_QUEUE_CAPACITY);
    client
        .watch_service(&args.service_name, peer_tx, watch_stop.clone())
        .await
        .context("watching peers")?;

    let lock = client.new_lock(&args.lock_name, &args.holder_id(), config.lock.ttl());
    let mut leadership = lock.subscribe();
    if let Err(e) = lock.acquire(Duration::ZERO).await {
        shutdown(&client, &info, &lock, &watch_stop).await;
        return Err(e).context("starting leader election");
    }

    let result = event_loop(tokio::signal::ctrl_c(), &mut peers, &mut leadership).await;
    shutdown(&client, &info, &lock, &watch_stop).await;
    result
}

/// Logs membership and leadership changes until `shutdown` resolves.
async fn event_loop(
    shutdown: impl Future<Output = std::io::Result<()>>,
    peers: &mut mpsc::Receiver<WatchServiceEvent>,
    leadership: &mut broadcast::Receiver<LockEvent>,
) -> anyhow::Result<()> {
    tokio::pin!(shutdown);
    let mut peers_open = true;
    loop {
        tokio::select! {
            signal = &mut shutdown => {
                signal.context("waiting for shutdown signal")?;
                info!("objdbd: Received SIGINT");
                return Ok(());
            }
            event = peers.recv(), if peers_open => match event {
                Some(event) => log_peer_event(&event),
                None => {
                    warn!("Peer watch ended");
                    peers_open = false;
                }
            },
            event = leadership.recv() => match event {
                Ok(event) => log_lock_event(event),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "Missed leadership events");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(anyhow::anyhow!("leader lock event stream closed"));
                }
            },
        }
    }
}

fn log_peer_event(event: &WatchServiceEvent) {
    let peer = &event.service_info;
    match event.event_type {
        WatchEventType::Add => info!(
            host = %peer.host_addr,
            port = peer.port,
            hostname = %peer.hostname,
            "Peer joined"
        ),
        WatchEventType::Del => info!(host = %peer.host_addr, port = peer.port, "Peer left"),
        WatchEventType::Error => warn!(service = %peer.service_name, "Peer watch error"),
    }
}

fn log_lock_event(event: LockEvent) {
    match event {
        LockEvent::Acquired => info!("Became leader"),
        LockEvent::Lost => warn!("Lost leadership"),
        LockEvent::Released => info!("Gave up leadership"),
        LockEvent::RefreshError => warn!("Leader lock session could not be renewed"),
        LockEvent::AcquireError => error!("Leader election failed to start"),
        LockEvent::AcquireTimeout => warn!("Leader election timed out"),
    }
}

async fn shutdown(
    client: &ObjdbClient,
    info: &ServiceInfo,
    lock: &DistributedLock,
    watch_stop: &CancellationToken,
) {
    info!("objdbd: Performing graceful shutdown");
    watch_stop.cancel();
    lock.release().await;
    lock.wait_stopped().await;
    if let Err(e) = client.deregister_service(info).await {
        warn!(service = %info.key(), error = %e, "Failed to deregister service");
    } else {
        debug!(service = %info.key(), "Service deregistered");
    }
}
