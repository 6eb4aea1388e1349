use clap::{Parser, Subcommand};
use polyrep::chain::{EventDecoder, JsonRpcLogSource, LogSource};
use polyrep::config::Config;
use polyrep::db::{init_db, Repository};
use polyrep::error::AppError;
use polyrep::metadata::SqliteMarketMetadata;
use polyrep::orchestration::{
    AggregationReport, Aggregator, BackfillReport, BackfillRequest, Backfiller,
};
use std::sync::Arc;
use tokio::sync::watch;

/// Polymarket OrderFilled indexer and realized-PnL engine.
#[derive(Parser)]
#[command(name = "polyrep", version)]
struct Cli {
    /// SQLite file, overrides DATABASE_PATH.
    #[arg(long, global = true)]
    database_path: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the database and apply the schema.
    InitDb,
    /// Index OrderFilled events over a block range.
    Backfill {
        #[arg(long)]
        start_block: Option<u64>,
        /// Defaults to END_BLOCK, then the chain head.
        #[arg(long)]
        end_block: Option<u64>,
        /// Maximum blocks per eth_getLogs query.
        #[arg(long)]
        chunk: Option<u64>,
        /// Stop once this many new trades were stored.
        #[arg(long)]
        stop_after: Option<u64>,
        /// Continue after the last committed block.
        #[arg(long)]
        resume: bool,
    },
    /// Rebuild realized PnL, user stats and tags.
    Compute,
    /// Decode the OrderFilled logs of one transaction.
    InspectTx {
        #[arg(long)]
        tx_hash: String,
    },
    /// Print index and derived-table counts.
    Status,
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        if let AppError::Backfill(inner) = &e {
            print_backfill_report(inner.report());
        }
        eprintln!("Error: {}", e);
        std::process::exit(e.exit_code());
    }
}

async fn run(cli: Cli) -> Result<(), AppError> {
    let mut config = Config::from_env()?;
    if let Some(path) = cli.database_path {
        config.database_path = path;
    }

    let pool = init_db(&config.database_path).await?;
    let repo = Arc::new(Repository::new(pool));

    match cli.command {
        Command::InitDb => {
            println!("database ready at {}", config.database_path);
            Ok(())
        }
        Command::Backfill {
            start_block,
            end_block,
            chunk,
            stop_after,
            resume,
        } => {
            if let Some(chunk) = chunk {
                if chunk == 0 {
                    return Err(AppError::BadRequest("--chunk must be at least 1".to_string()));
                }
                config.fetch.chunk_size = chunk;
            }
            let source: Arc<dyn LogSource> =
                Arc::new(JsonRpcLogSource::new(config.require_rpc_url()?));

            let from_block = start_block.or(config.start_block).ok_or_else(|| {
                AppError::BadRequest("--start-block or START_BLOCK is required".to_string())
            })?;
            let to_block = match end_block.or(config.end_block) {
                Some(block) => block,
                None => source.latest_block().await?,
            };

            let backfiller = Backfiller::new(
                source,
                repo.clone(),
                config.fetch.clone(),
                config.exchange_addresses.clone(),
            );
            let from_block = if resume {
                backfiller.resume_from(from_block).await?
            } else {
                from_block
            };
            if from_block > to_block {
                println!("nothing to do: start {} is past end {}", from_block, to_block);
                return Ok(());
            }

            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("Ctrl-C received, stopping after the current chunk");
                    let _ = shutdown_tx.send(true);
                }
            });

            let report = backfiller
                .run(
                    BackfillRequest {
                        from_block,
                        to_block,
                        stop_after,
                    },
                    shutdown_rx,
                )
                .await?;
            print_backfill_report(&report);
            Ok(())
        }
        Command::Compute => {
            let metadata = Arc::new(SqliteMarketMetadata::new(repo.clone()));
            let aggregator = Aggregator::new(repo, metadata, config.aggregation.clone());
            let report = aggregator.recompute().await?;
            print_aggregation_report(&report);
            Ok(())
        }
        Command::InspectTx { tx_hash } => {
            let source = JsonRpcLogSource::new(config.require_rpc_url()?);
            let decoder = EventDecoder::new();
            let logs = source.transaction_logs(&tx_hash).await?;
            let stored = repo.trades_for_tx(&tx_hash.to_ascii_lowercase()).await?;

            let mut decoded = 0;
            for log in logs
                .iter()
                .filter(|log| log.topics.first().map(String::as_str) == Some(decoder.topic0()))
            {
                let ts = source.block_timestamp(log.block_number).await.ok().flatten();
                match decoder.decode(log, ts) {
                    Ok(trade) => {
                        decoded += 1;
                        let in_store = stored.iter().any(|t| t.key() == trade.key());
                        let proof = trade.proof_json().map_err(|e| {
                            AppError::BadRequest(format!("cannot render proof: {}", e))
                        })?;
                        println!(
                            "{} {} price={} size={} stored={}",
                            trade.key(),
                            trade.side.as_str(),
                            trade.price,
                            trade.filled_size,
                            in_store
                        );
                        println!("{}", proof);
                    }
                    Err(skipped) => println!("{}:{} skipped: {}", tx_hash, log.log_index, skipped),
                }
            }
            println!(
                "{} log(s) in receipt, {} OrderFilled decoded, {} stored",
                logs.len(),
                decoded,
                stored.len()
            );
            Ok(())
        }
        Command::Status => {
            let trades = repo.count_trades().await?;
            let max_block = repo.max_known_block().await?;
            let committed = repo.last_committed_block().await?;
            let (unresolved, resolved) = repo.market_counts().await?;
            let derived = repo.derived_counts().await?;
            println!("trades:               {}", trades);
            println!("max known block:      {}", display_opt(max_block));
            println!("last committed block: {}", display_opt(committed));
            println!("markets:              {} resolved, {} unresolved", resolved, unresolved);
            println!("user_market_pnl rows: {}", derived.user_market_pnl);
            println!("user_stats rows:      {}", derived.user_stats);
            println!("user_tags rows:       {}", derived.user_tags);
            Ok(())
        }
    }
}

fn display_opt(value: Option<u64>) -> String {
    value.map_or_else(|| "-".to_string(), |v| v.to_string())
}

fn print_backfill_report(report: &BackfillReport) {
    println!("stopped:              {:?}", report.stopped);
    println!("chunks processed:     {}", report.chunks_processed);
    println!("logs seen:            {}", report.logs_seen);
    println!("trades inserted:      {}", report.trades_inserted);
    println!("already present:      {}", report.trades_already_present);
    println!(
        "last committed block: {}",
        display_opt(report.last_committed_block)
    );
    for (reason, count) in &report.skipped {
        println!("skipped {:<16}{}", format!("{}:", reason), count);
    }
}

fn print_aggregation_report(report: &AggregationReport) {
    println!(
        "markets:        {} resolved, {} unresolved, {} missing, {} flagged",
        report.markets_resolved,
        report.markets_unresolved,
        report.markets_missing,
        report.flagged.len()
    );
    for flagged in &report.flagged {
        println!("  flagged {}: {}", flagged.market_id, flagged.reason);
    }
    println!("fills counted:  {}", report.fills_considered);
    println!(
        "rows written:   {} pnl, {} users, {} tags",
        report.counts.user_market_pnl, report.counts.user_stats, report.counts.user_tags
    );
    println!("digest:         {}", report.digest);
}
