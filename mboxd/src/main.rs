mod config;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;

use config::{read_config, AccountEntry, DaemonConfig, StorageBackend};
use mbox_collections::Account;
use mbox_store::{InMemoryStore, PermanentStore};

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    #[clap(short, long, env = "MBOXD_CONFIG", default_value = "mboxd.toml")]
    /// Path to the daemon's configuration file
    config_file: PathBuf,

    /// Run a single in-memory "default" account without reading a config
    /// file, for local experimentation.
    #[clap(long)]
    dev: bool,
}

fn tracer() {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "mboxd=info,mbox_collections=info,mbox_store=info");
    }
    tracing_subscriber::fmt::init();
}

#[tokio::main]
async fn main() -> Result<()> {
    tracer();

    let args = Args::parse();
    let config = if args.dev {
        DaemonConfig {
            pid: None,
            accounts: vec![AccountEntry {
                name: "default".to_string(),
                storage: StorageBackend::InMemory,
            }],
        }
    } else {
        read_config(args.config_file)?
    };

    let mut accounts = Vec::new();
    for entry in &config.accounts {
        tracing::info!(account = entry.name.as_str(), "opening account");
        let backend: Arc<dyn PermanentStore> = match entry.storage {
            StorageBackend::InMemory => Arc::new(InMemoryStore::new()),
        };
        let account = Account::new(backend).await?;
        accounts.push(account);
    }

    tracing::info!(count = accounts.len(), "accounts ready, awaiting shutdown signal");
    tokio::signal::ctrl_c().await?;

    tracing::info!("shutting down, stopping write-back loops");
    for account in &accounts {
        account.memstore().stop();
    }

    Ok(())
}
