mod api;
mod client;
mod dispatch;
mod session;
#[cfg(test)]
mod testutil;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use wasend_channels::{qr::generate_qr_terminal, whatsapp::WhatsAppFactory};
use wasend_core::{
    config::{self, shellexpand, Config},
    link::{LinkState, DEFAULT_SESSION_ID},
};

use client::{ApiClient, DispatchRequest};
use dispatch::DispatchService;
use session::SessionRegistry;

/// How often `wasend link` polls the server while waiting for a scan.
const LINK_POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Parser)]
#[command(
    name = "wasend",
    version,
    about = "WhatsApp device linking and bulk message dispatch"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to config file.
    #[arg(short, long, default_value = "config.toml")]
    config: String,
}

/// Options shared by the commands that talk to a running server.
#[derive(clap::Args)]
struct Remote {
    /// Base URL of the wasend server.
    #[arg(long, env = "WASEND_SERVER", default_value = "http://127.0.0.1:4001")]
    server: String,

    /// Link session to act on.
    #[arg(long, default_value = DEFAULT_SESSION_ID)]
    session: String,

    /// Bearer token, if the server requires one.
    #[arg(long, env = "WASEND_API_KEY")]
    api_key: Option<String>,
}

impl Remote {
    fn client(&self) -> ApiClient {
        ApiClient::new(&self.server, &self.session, self.api_key.clone())
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP server.
    Serve,
    /// Link a device: show the QR code and wait for the scan.
    Link {
        #[command(flatten)]
        remote: Remote,
    },
    /// Send a message to every recipient in a spreadsheet.
    Send {
        /// Message template; `{{column}}` is replaced per row.
        #[arg(short, long)]
        message: String,

        /// Recipient spreadsheet (.xlsx).
        #[arg(short, long)]
        file: Option<PathBuf>,

        #[command(flatten)]
        remote: Remote,
    },
    /// Log the linked device out and forget its credentials.
    Unlink {
        #[command(flatten)]
        remote: Remote,
    },
    /// Show the link state of a session.
    Status {
        #[command(flatten)]
        remote: Remote,
    },
}

/// Install the tracing subscriber. `RUST_LOG` wins over the configured level.
///
/// When `to_file` is set, logs are also written to `{data_dir}/logs/wasend.log`;
/// the returned guard must be kept alive to flush them.
fn init_logging(cfg: &Config, to_file: bool) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cfg.wasend.log_level));

    let (file_layer, guard) = if to_file {
        let log_dir = PathBuf::from(shellexpand(&cfg.wasend.data_dir)).join("logs");
        std::fs::create_dir_all(&log_dir)?;
        let appender = tracing_appender::rolling::never(&log_dir, "wasend.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        (
            Some(fmt::layer().with_ansi(false).with_writer(writer)),
            Some(guard),
        )
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(file_layer)
        .init();

    Ok(guard)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = config::load(&cli.config)?;
    let _log_guard = init_logging(&cfg, matches!(cli.command, Commands::Serve))?;

    match cli.command {
        Commands::Serve => serve(cfg).await?,
        Commands::Link { remote } => link(&remote.client(), cfg.link.qr_timeout()).await?,
        Commands::Send {
            message,
            file,
            remote,
        } => {
            // Validate locally before touching the network.
            let request = DispatchRequest::new(&message, file.as_deref())?;
            let outcome = remote.client().send_messages(request).await?;
            println!("{}", outcome.message);
            for failure in &outcome.report.failures {
                println!("  row {}: {} ({})", failure.row, failure.phone, failure.error);
            }
        }
        Commands::Unlink { remote } => {
            let ack = remote.client().unlink().await?;
            println!("{}", ack.message);
        }
        Commands::Status { remote } => {
            let snapshot = remote.client().state().await?;
            println!("session: {}", snapshot.session_id);
            println!("state:   {}", snapshot.state);
            if let Some(reason) = snapshot.failure {
                println!("failure: {reason}");
            }
        }
    }

    Ok(())
}

async fn serve(cfg: Config) -> anyhow::Result<()> {
    tracing::info!(name = %cfg.wasend.name, "starting wasend server");

    let factory = Arc::new(WhatsAppFactory::new(
        cfg.whatsapp.clone(),
        &cfg.wasend.data_dir,
    ));
    let sessions = Arc::new(SessionRegistry::new(factory, cfg.link.qr_timeout()));
    let dispatch = Arc::new(DispatchService::new(&cfg.dispatch));

    api::serve(&cfg.api, sessions, dispatch).await
}

/// Start linking and print each new QR code until the session settles.
async fn link(client: &ApiClient, qr_timeout: Duration) -> anyhow::Result<()> {
    let ack = client.link_device().await?;
    println!("{}", ack.message);

    let deadline = tokio::time::Instant::now() + qr_timeout + LINK_POLL_INTERVAL;
    let mut shown_qr: Option<String> = None;

    loop {
        let snapshot = client.state().await?;
        match snapshot.state {
            LinkState::Linked => {
                println!("Device linked.");
                return Ok(());
            }
            LinkState::Failed => {
                anyhow::bail!(
                    "device linking failed: {}",
                    snapshot.failure.unwrap_or_else(|| "unknown reason".into())
                );
            }
            LinkState::Unlinked => anyhow::bail!("device linking was cancelled"),
            LinkState::AwaitingScan => {
                if let Some(qr) = snapshot.qr {
                    if shown_qr.as_deref() != Some(qr.as_str()) {
                        println!("\nScan this QR code in WhatsApp > Linked devices:\n");
                        println!("{}", generate_qr_terminal(&qr)?);
                        shown_qr = Some(qr);
                    }
                }
            }
        }

        if tokio::time::Instant::now() >= deadline {
            anyhow::bail!("timed out waiting for the QR code to be scanned");
        }
        tokio::time::sleep(LINK_POLL_INTERVAL).await;
    }
}
