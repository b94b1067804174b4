use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use blobxfer_http::{HttpTransport, RetryConfig};
use blobxfer_manager::{
    BlobClient, ClientOptions, JsonFileStore, ManagerConfig, Transfer, TransferEvent,
    TransferManager, default_config_path,
};
use blobxfer_protocol::TransferState;
use blobxfer_transfer::{DownloadOptions, UploadOptions};

const RESTORATION_ID: &str = "blobxfer-cli";

const USAGE: &str = "\
Usage: blobxfer [--config <file>] <command>

Commands:
  download <url> <path>                 Download a blob to a local file
  upload <path> <url> [--type <mime>]   Upload a local file as a block blob
  list                                  List persisted transfers
  resume                                Resume every unfinished transfer";

#[derive(Debug, PartialEq)]
enum Command {
    Download { url: String, path: PathBuf },
    Upload {
        path: PathBuf,
        url: String,
        content_type: Option<String>,
    },
    List,
    Resume,
}

#[derive(Debug, PartialEq)]
struct Args {
    config: Option<PathBuf>,
    command: Command,
}

fn parse_args(args: &[String]) -> Result<Args> {
    let mut config = None;
    let mut content_type = None;
    let mut positional = Vec::new();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                let path = iter.next().ok_or_else(|| anyhow!("--config needs a path"))?;
                config = Some(PathBuf::from(path));
            }
            "--type" | "-t" => {
                let mime = iter.next().ok_or_else(|| anyhow!("--type needs a value"))?;
                content_type = Some(mime.clone());
            }
            _ => positional.push(arg.as_str()),
        }
    }

    let command = match positional.as_slice() {
        ["download", url, path] => Command::Download {
            url: url.to_string(),
            path: PathBuf::from(path),
        },
        ["upload", path, url] => Command::Upload {
            path: PathBuf::from(path),
            url: url.to_string(),
            content_type,
        },
        ["list"] => Command::List,
        ["resume"] => Command::Resume,
        _ => bail!("{USAGE}"),
    };
    Ok(Args { config, command })
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let argv: Vec<String> = std::env::args().skip(1).collect();
    let args = parse_args(&argv)?;

    let config_path = match args.config {
        Some(path) => path,
        None => default_config_path().context("cannot determine the config directory")?,
    };
    let config = ManagerConfig::load(&config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;
    let store_dir = config
        .resolved_store_dir()
        .context("cannot determine the transfer store directory")?;
    let store = JsonFileStore::open(&store_dir)
        .with_context(|| format!("failed to open {}", store_dir.display()))?;

    let manager = Arc::new(TransferManager::new(config, Arc::new(store)));
    let transport = Arc::new(HttpTransport::new(RetryConfig::default())?);
    let client = BlobClient::new(manager.clone(), transport, ClientOptions::new(RESTORATION_ID))?;

    if let Command::List = args.command {
        list(&manager);
        return Ok(());
    }

    let mut events = manager
        .take_events()
        .await
        .context("event stream already taken")?;
    manager.start_managing().await?;

    let watched = match args.command {
        Command::Download { url, path } => {
            let transfer = client
                .download(url, path, DownloadOptions::default())
                .await?;
            vec![transfer]
        }
        Command::Upload {
            path,
            url,
            content_type,
        } => {
            let options = UploadOptions {
                content_type,
                ..UploadOptions::default()
            };
            vec![client.upload(path, url, options).await?]
        }
        Command::Resume => {
            let pending: Vec<Transfer> = client
                .transfers()
                .into_iter()
                .filter(|t| t.state().is_active())
                .collect();
            info!(count = pending.len(), "resuming unfinished transfers");
            pending
        }
        Command::List => Vec::new(),
    };

    let outcome = wait(&mut events, &watched).await;
    manager.stop_managing().await;
    drop(client);
    outcome
}

/// Waits until every watched transfer settles, or Ctrl-C.
///
/// Ctrl-C leaves the transfers paused and persisted for `resume`.
async fn wait(events: &mut mpsc::Receiver<TransferEvent>, watched: &[Transfer]) -> Result<()> {
    let settled = |t: &&Transfer| !t.state().is_active();
    let mut ids: HashSet<Uuid> = watched.iter().map(Transfer::id).collect();
    let mut sweep = tokio::time::interval(Duration::from_secs(1));
    while !ids.is_empty() {
        let event = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                eprintln!("\n  interrupted, run `blobxfer resume` to continue");
                return Ok(());
            }
            // Events are dropped when the channel is full.
            _ = sweep.tick() => {
                for t in watched.iter().filter(settled) {
                    ids.remove(&t.id());
                }
                continue;
            }
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        match event {
            TransferEvent::StateChanged {
                id,
                state,
                progress,
            } if ids.contains(&id) => {
                eprint!(
                    "\r  {id}  {:<12} {:>3}%  {}/{} bytes",
                    state.label(),
                    progress.as_percent(),
                    progress.bytes,
                    progress.total_bytes
                );
                if state == TransferState::Paused || state.is_terminal() {
                    eprintln!();
                    ids.remove(&id);
                }
            }
            TransferEvent::Failed { id, error } if ids.contains(&id) => {
                eprintln!("\n  {id} failed: {error}");
                ids.remove(&id);
            }
            _ => {}
        }
    }

    let failed = watched
        .iter()
        .filter(|t| t.state() == TransferState::Failed)
        .count();
    if failed > 0 {
        bail!("{failed} transfer(s) failed");
    }
    Ok(())
}

fn list(manager: &TransferManager) {
    let transfers = manager.transfers();
    if transfers.is_empty() {
        eprintln!("  no transfers");
        return;
    }
    for transfer in transfers {
        let Some(record) = transfer.record() else {
            continue;
        };
        let progress = record.progress();
        println!(
            "{}  {:<8} {:<12} {:>3}%  {} -> {}",
            record.id,
            record.transfer_type().to_string(),
            record.state.label(),
            progress.as_percent(),
            record.source(),
            record.destination()
        );
        if let Some(error) = &record.error {
            println!("    last error: {error}");
        }
    }
}
