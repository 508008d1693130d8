use std::path::PathBuf;

use anyhow::{anyhow, Result};
use bidstamp_core::{map_transaction_id, select_timestamp, TransactionId};
use bidstamp_store_sqlite::SqliteStore;
use clap::{Args, Parser, Subcommand};
use serde_json::Value;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "bidctl")]
#[command(about = "Administration CLI for the bidstamp document store")]
struct Cli {
    #[arg(long, env = "BIDSTAMP_DB", default_value = "./bidstamp.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    Txid {
        #[command(subcommand)]
        command: TxidCommand,
    },
    Time {
        #[command(subcommand)]
        command: TimeCommand,
    },
    Bids {
        #[command(subcommand)]
        command: BidsCommand,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    IntegrityCheck,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Subcommand)]
enum TxidCommand {
    /// Print the CRC-32 bucket (1-10) of a transaction id.
    Bucket(TxidArgs),
}

#[derive(Debug, Subcommand)]
enum TimeCommand {
    /// List every time-sync document recorded for a transaction id.
    List(TxidArgs),
    /// Show the timestamp deterministically selected for a transaction id.
    Select(TxidArgs),
}

#[derive(Debug, Subcommand)]
enum BidsCommand {
    List,
}

#[derive(Debug, Args)]
struct TxidArgs {
    txid: String,
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Db { command } => {
            let mut store = SqliteStore::open(&cli.db)?;
            run_db(command, &mut store)
        }
        Command::Txid { command } => run_txid(command),
        Command::Time { command } => {
            let mut store = SqliteStore::open(&cli.db)?;
            store.migrate()?;
            run_time(command, &store)
        }
        Command::Bids { command } => {
            let mut store = SqliteStore::open(&cli.db)?;
            store.migrate()?;
            run_bids(command, &store)
        }
    }
}

fn run_db(command: DbCommand, store: &mut SqliteStore) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = store.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty()
            }))
        }
        DbCommand::Migrate(args) => run_db_migrate(&args, store),
        DbCommand::IntegrityCheck => {
            let report = store.integrity_check()?;
            emit_json(serde_json::to_value(report)?)
        }
    }
}

fn run_db_migrate(args: &DbMigrateArgs, store: &mut SqliteStore) -> Result<()> {
    let before = store.schema_status()?;
    if args.dry_run {
        return emit_json(serde_json::json!({
            "dry_run": true,
            "current_version": before.current_version,
            "target_version": before.target_version,
            "would_apply_versions": before.pending_versions
        }));
    }

    store.migrate()?;
    let after = store.schema_status()?;
    emit_json(serde_json::json!({
        "dry_run": false,
        "before_version": before.current_version,
        "applied_versions": before.pending_versions,
        "after_version": after.current_version,
        "target_version": after.target_version,
        "up_to_date": after.pending_versions.is_empty()
    }))
}

fn run_txid(command: TxidCommand) -> Result<()> {
    match command {
        TxidCommand::Bucket(args) => emit_json(serde_json::json!({
            "transaction_id": args.txid,
            "bucket": map_transaction_id(&args.txid)
        })),
    }
}

fn run_time(command: TimeCommand, store: &SqliteStore) -> Result<()> {
    match command {
        TimeCommand::List(args) => {
            let txid = TransactionId::new(args.txid);
            let documents = store.find_time_syncs(&txid)?;
            let timestamps = documents
                .iter()
                .map(|document| document.record.timestamp.clone())
                .collect::<Vec<_>>();
            emit_json(serde_json::json!({
                "transaction_id": txid,
                "timestamps": timestamps,
                "documents": documents
            }))
        }
        TimeCommand::Select(args) => {
            let txid = TransactionId::new(args.txid);
            let candidates = store.timestamps_for_transaction(&txid)?;
            let selection = select_timestamp(&txid, &candidates)
                .ok_or_else(|| anyhow!("no timestamps recorded for transaction {txid}"))?;
            emit_json(serde_json::to_value(selection)?)
        }
    }
}

fn run_bids(command: BidsCommand, store: &SqliteStore) -> Result<()> {
    match command {
        BidsCommand::List => {
            let bids = store.list_bids()?;
            emit_json(serde_json::json!({ "count": bids.len(), "bids": bids }))
        }
    }
}
