use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::signal;
use tokio::task::JoinHandle;
use tracing::{info, warn, Level};

use gossipvote::config::{
    CoordinatorConfig, GossipVoteConfig, LogClientConfig, LogServerConfig, ParticipantConfig,
};
use gossipvote::coordinator::{Coordinator, Verdict};
use gossipvote::participant::Participant;
use gossipvote::transport::{EventForwarder, FileSink, LogClient, LogServer};

#[derive(Debug, Parser)]
#[command(name = "gossipvote", version, about = "Gossip-based majority voting")]
struct Cli {
    /// YAML file with shared defaults
    #[arg(long, global = true)]
    config: Option<String>,

    /// Log at DEBUG instead of INFO
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    role: Role,
}

#[derive(Debug, Subcommand)]
enum Role {
    /// Run the rendezvous coordinator
    Coordinator {
        /// Port participants join on
        port: u16,
        /// Port of the log receiver
        logger_port: u16,
        /// Number of participants to wait for
        participants: usize,
        /// Timeout in milliseconds
        timeout_ms: u64,
        /// Candidate choices
        #[arg(required = true)]
        options: Vec<String>,
    },
    /// Run a voting participant
    Participant {
        /// Port of the coordinator
        coordinator_port: u16,
        /// Port of the log receiver
        logger_port: u16,
        /// Own listening port, used as this participant's identity
        port: u16,
        /// Timeout in milliseconds
        timeout_ms: u64,
    },
    /// Run the log receiver
    Logger {
        /// UDP port to listen on
        port: u16,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_max_level(if cli.verbose { Level::DEBUG } else { Level::INFO })
        .with_target(false)
        .with_thread_ids(true)
        .init();

    let config = match &cli.config {
        Some(path) => GossipVoteConfig::from_file(path)?,
        None => GossipVoteConfig::default(),
    };
    info!(version = env!("CARGO_PKG_VERSION"), "Starting gossipvote");

    match cli.role {
        Role::Coordinator {
            port,
            logger_port,
            participants,
            timeout_ms,
            options,
        } => {
            let timeout = Duration::from_millis(timeout_ms);
            let log = log_forwarder(&config, logger_port, port, timeout);
            let coordinator_config = CoordinatorConfig {
                host: config.network.host,
                port,
                participants,
                timeout,
                options,
            };
            let coordinator = Coordinator::bind(coordinator_config, log.events.clone()).await?;
            let verdicts = coordinator.run().await?;

            for verdict in &verdicts {
                match verdict {
                    Verdict::Decided {
                        participant,
                        choice,
                        contributors,
                    } => info!(participant, choice = %choice, contributors = ?contributors, "Outcome"),
                    Verdict::Crashed {
                        participant,
                        reason,
                    } => warn!(participant, reason = ?reason, "Crashed"),
                }
            }
            log.flush().await;
        }
        Role::Participant {
            coordinator_port,
            logger_port,
            port,
            timeout_ms,
        } => {
            let timeout = Duration::from_millis(timeout_ms);
            let log = log_forwarder(&config, logger_port, port, timeout);
            let participant_config = ParticipantConfig {
                host: config.network.host,
                coordinator_port,
                port,
                timeout,
            };
            let participant = Participant::bind(participant_config, log.events.clone()).await?;
            let decision = participant.run().await?;
            info!(
                choice = %decision.choice,
                contributors = ?decision.contributors,
                "Participant finished"
            );
            log.flush().await;
        }
        Role::Logger { port } => {
            let server_config = LogServerConfig {
                listen_addr: SocketAddr::new(config.network.host, port),
                max_datagram_bytes: config.logging.max_datagram_bytes,
                log_dir: config.logging.log_dir.clone(),
            };
            let sink = Arc::new(FileSink::create(&server_config.log_dir)?);
            info!(path = %sink.path().display(), "Writing log file");
            LogServer::bind(&server_config)
                .await?
                .serve_with_shutdown(sink, shutdown_signal())
                .await?;
        }
    }

    Ok(())
}

fn log_forwarder(
    config: &GossipVoteConfig,
    logger_port: u16,
    tag: u16,
    ack_timeout: Duration,
) -> LogForwarder {
    let client_config = LogClientConfig {
        server_addr: SocketAddr::new(config.network.host, logger_port),
        tag,
        ack_timeout,
        max_attempts: config.logging.max_attempts,
        max_datagram_bytes: config.logging.max_datagram_bytes,
    };
    let window = client_config.delivery_window();
    let (forwarder, flushed) = LogClient::new(client_config).into_forwarder();
    LogForwarder {
        events: Arc::new(forwarder),
        flushed,
        window,
    }
}

struct LogForwarder {
    events: Arc<EventForwarder>,
    flushed: JoinHandle<()>,
    /// How long one unacknowledged event can hold up the queue
    window: Duration,
}

impl LogForwarder {
    /// Give queued log events a bounded chance to reach the receiver.
    ///
    /// The wait covers a single event exhausting its retries. With an
    /// unreachable receiver, events queued behind the first may be dropped
    /// at exit.
    async fn flush(self) {
        drop(self.events);
        if tokio::time::timeout(self.window, self.flushed).await.is_err() {
            warn!("Exiting with log events still undelivered");
        }
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down");
        }
    }
}
