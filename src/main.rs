mod blob;
mod config;
mod credentials;
mod gmail;
mod message;
mod persist;
mod ratelimit;
mod store;
mod sync;

use std::env;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::blob::BlobStore;
use crate::config::Config;
use crate::gmail::GmailStore;
use crate::persist::Db;
use crate::ratelimit::RateLimiter;

fn setup_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,gotmuch=debug"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn print_usage() {
    eprintln!(
        r#"gotmuch - mirror a Gmail mailbox into a notmuch mail store

Usage: gotmuch [command]

Commands:
    (none)      Run a synchronization pass
    help        Show this help message

Configuration file: ~/.config/gotmuch/config.toml
The Gmail access token comes from the GOTMUCH_ACCESS_TOKEN environment
variable, the configured account.token_command, or a token file in the
config directory.
"#
    );
}

async fn run() -> Result<()> {
    let config = Config::load()?;
    config.ensure_dirs()?;

    let store_root = match &config.store_root {
        Some(path) => path.clone(),
        None => blob::notmuch_database_path()
            .context("Failed to locate the notmuch database; set store_root in the config")?,
    };
    let blobs = Arc::new(
        BlobStore::new(&store_root, &config.account.email)
            .context("Failed to initialize the local message store")?,
    );

    let db_path = config.database_path()?;
    tracing::debug!("opening database at {}", db_path.display());
    let db = Db::open(&db_path)
        .await
        .context("Failed to initialize the database")?;

    let creds = credentials::CredentialStore::new(
        &config.account.email,
        config.account.token_command.clone(),
    );
    let access_token = creds.access_token()?;

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("interrupt received, stopping at the next safe point");
                cancel.cancel();
            }
        }
    });

    let limiter = RateLimiter::new(config.rate.per_second, config.rate.burst);
    let store = Arc::new(
        GmailStore::new(access_token, limiter, cancel.clone())
            .context("Failed to initialize the Gmail client")?,
    );

    let result = sync::sync(store, &db, blobs, &config.account.email, cancel)
        .await
        .context("Failed to synchronize");
    db.close().await;
    result?;

    tracing::info!("synchronization complete");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();

    match args.get(1).map(|s| s.as_str()) {
        Some("help") | Some("--help") | Some("-h") => {
            print_usage();
            Ok(())
        }
        Some(cmd) => {
            eprintln!("Unknown command: {cmd}");
            print_usage();
            std::process::exit(1);
        }
        None => {
            setup_logging();
            run().await
        }
    }
}
