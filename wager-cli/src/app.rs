use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio::sync::oneshot;
use tracing::{info, warn};
use wager_config::AppConfig;
use wager_core::{AccountKey, Amount};
use wager_engine::{
    IngestOutcome, IngestionService, ReconciliationScheduler, Reconciler, TransactionRequest,
};
use wager_ledger::{LedgerStore, SqliteLedgerStore};

use crate::http::spawn_http_server;
use crate::telemetry::init_tracing;

#[derive(Parser, Debug)]
#[command(author, version, about = "Idempotent wager ledger")]
pub struct Cli {
    /// Configuration file (defaults to config/wager.toml when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    /// Override the SQLite database path
    #[arg(long, global = true)]
    database: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the HTTP endpoint and the reconciliation scheduler
    Serve,
    /// Apply a single wager, as the endpoint would
    Apply(ApplyArgs),
    /// Run one reconciliation pass over an account
    Reconcile {
        #[arg(long)]
        account: Option<String>,
        /// Window size; defaults to the configured one
        #[arg(long)]
        window: Option<usize>,
    },
    /// Print the current balance
    Balance {
        #[arg(long)]
        account: Option<String>,
    },
    /// Print the most recent transactions, newest first
    History {
        #[arg(long)]
        account: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Account management
    Account {
        #[command(subcommand)]
        action: AccountCommand,
    },
}

#[derive(Args, Debug)]
pub struct ApplyArgs {
    /// External transaction identifier
    #[arg(long)]
    id: String,
    /// win or lose
    #[arg(long)]
    state: String,
    /// Decimal amount, e.g. 10.15
    #[arg(long)]
    amount: String,
    #[arg(long, default_value = "game")]
    source: String,
    #[arg(long)]
    account: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum AccountCommand {
    /// Register an account under a routing key
    Create {
        key: String,
        /// Opening balance
        #[arg(long, default_value = "0")]
        balance: String,
    },
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let mut config = AppConfig::load(cli.config.as_deref())?;
    if let Some(path) = cli.database {
        config.database.path = path;
    }
    let _guard = init_tracing(&config.log)?;

    let store = Arc::new(
        SqliteLedgerStore::new(&config.database.path, config.database.busy_timeout())
            .with_context(|| format!("failed to open ledger at {}", config.database.path.display()))?,
    );

    match cli.command {
        Commands::Serve => serve(config, store).await,
        Commands::Apply(args) => apply(&config, store, args).await,
        Commands::Reconcile { account, window } => {
            let key = account_key(&config, account);
            let window = window.unwrap_or(config.reconciliation.window);
            if window == 0 {
                bail!("window must be greater than zero");
            }
            let reconciler = Reconciler::new(store);
            let report = blocking(move || Ok(reconciler.reconcile_window(&key, window)?)).await?;
            println!(
                "account {} examined={} cancelled={} delta={} balance={}",
                report.account,
                report.examined,
                report.cancelled.len(),
                report.delta,
                report.balance
            );
            for id in &report.cancelled {
                println!("  cancelled {id}");
            }
            Ok(())
        }
        Commands::Balance { account } => {
            let key = account_key(&config, account);
            let lookup = key.clone();
            let found = blocking(move || Ok(store.account(&lookup)?)).await?;
            match found {
                Some(account) => {
                    println!("{}", account.balance);
                    Ok(())
                }
                None => bail!("account {key} does not exist"),
            }
        }
        Commands::History { account, limit } => {
            let key = account_key(&config, account);
            let records = blocking(move || Ok(store.history(&key, limit)?)).await?;
            for record in records {
                println!(
                    "{} {} {} {} {} {}{}",
                    record.created_at.to_rfc3339(),
                    record.id,
                    record.state,
                    record.amount,
                    record.source,
                    record.status,
                    if record.cancelled { " cancelled" } else { "" }
                );
            }
            Ok(())
        }
        Commands::Account {
            action: AccountCommand::Create { key, balance },
        } => {
            let opening = Amount::parse(&balance)
                .with_context(|| format!("invalid opening balance '{balance}'"))?;
            let key = AccountKey::from(key);
            let account = blocking(move || Ok(store.create_account(&key, opening)?)).await?;
            info!(account = %account.routing_key, balance = %account.balance, "account created");
            println!("{} {}", account.routing_key, account.balance);
            Ok(())
        }
    }
}

async fn serve(config: AppConfig, store: Arc<SqliteLedgerStore>) -> Result<()> {
    let service = Arc::new(IngestionService::new(
        Arc::clone(&store),
        config.ledger.clone(),
    ));
    let default_account = service.default_account();
    if store.account(&default_account)?.is_none() {
        warn!(
            account = %default_account,
            "default account does not exist; create it with `wager account create`"
        );
    }

    let scheduler = if config.reconciliation.enabled {
        let accounts = config
            .reconciled_accounts()
            .into_iter()
            .map(AccountKey::from)
            .collect();
        Some(
            ReconciliationScheduler::from_config(
                Arc::clone(&store),
                accounts,
                &config.reconciliation,
            )
            .start(),
        )
    } else {
        info!("reconciliation disabled");
        None
    };

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let (addr, server) = spawn_http_server(config.http.addr, service, async move {
        let _ = shutdown_rx.await;
    })?;
    info!(%addr, database = %config.database.path.display(), "wager service ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown requested");

    let _ = shutdown_tx.send(());
    if let Err(err) = server.await {
        warn!(error = %err, "HTTP server task ended abnormally");
    }
    if let Some(handle) = scheduler {
        handle.stop().await;
    }
    Ok(())
}

async fn apply(config: &AppConfig, store: Arc<SqliteLedgerStore>, args: ApplyArgs) -> Result<()> {
    let request = TransactionRequest {
        account: account_key(config, args.account),
        transaction_id: args.id,
        state: args.state,
        amount: args.amount,
        source: args.source,
    };
    let service = IngestionService::new(store, config.ledger.clone());
    let outcome = blocking(move || Ok(service.apply(&request)?)).await?;
    match outcome {
        IngestOutcome::Applied { balance } => println!("applied, balance {balance}"),
        IngestOutcome::Replayed => println!("already processed"),
    }
    Ok(())
}

fn account_key(config: &AppConfig, account: Option<String>) -> AccountKey {
    AccountKey::from(account.unwrap_or_else(|| config.ledger.account_key.clone()))
}

async fn blocking<T, F>(work: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .context("blocking ledger task failed")?
}
