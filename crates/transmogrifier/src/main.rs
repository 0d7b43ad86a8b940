use anyhow::Context;
use clap::Parser;
use derivative::Derivative;
use grid_catalog::postgres::PostgresCatalogGateway;
use grid_heartbeat::postgres::PostgresHeartbeatService;
use grid_heartbeat::{HeartbeatId, HeartbeatService};
use grid_supervisor::StopToken;

/// Transmogrifier evaluates new data identifiers against active
/// subscriptions and creates the replication rules they describe.
#[derive(Derivative, Parser)]
#[derivative(Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// URL of the postgres database backing the catalog and heartbeats.
    #[derivative(Debug = "ignore")]
    #[clap(long = "database", env = "DATABASE_URL")]
    database_url: url::Url,
    /// Number of worker threads to run in this process.
    #[clap(long, default_value = "1", env = "TRANSMOGRIFIER_THREADS")]
    threads: u32,
    /// Maximum new DIDs fetched per worker per iteration.
    #[clap(long, default_value = "100", env = "TRANSMOGRIFIER_BULK")]
    bulk: u32,
    /// Run a single iteration per worker and exit, instead of looping
    /// forever. Intended for tests and cron-style invocation.
    #[clap(long)]
    run_once: bool,
}

/// Every iteration is floor-padded to this long, even when it finished in
/// no time (e.g. an empty shard), so an idle worker doesn't spin.
const ITERATION_FLOOR: std::time::Duration = std::time::Duration::from_secs(10);

fn main() -> Result<(), anyhow::Error> {
    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .expect("failed to install default crypto provider");

    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting tracing default failed");

    let args = Args::parse();
    tracing::info!(?args, "started!");

    let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
    let result = runtime.block_on(async_main(args));
    tracing::info!(?result, "main function completed, shutting down runtime");
    runtime.shutdown_timeout(std::time::Duration::from_secs(5));
    result
}

async fn async_main(args: Args) -> Result<(), anyhow::Error> {
    let application_name = std::env::var("HOSTNAME").unwrap_or_else(|_| "transmogrifier".to_string());
    let mut pg_options = args
        .database_url
        .as_str()
        .parse::<sqlx::postgres::PgConnectOptions>()
        .context("parsing database URL")?
        .application_name(&application_name);
    pg_options = pg_options.ssl_mode(sqlx::postgres::PgSslMode::Prefer);

    let pg_pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(args.threads.max(1) + 2)
        .connect_with(pg_options)
        .await
        .context("connecting to database")?;

    let catalog = std::sync::Arc::new(PostgresCatalogGateway::new(pg_pool.clone()));
    let heartbeats = std::sync::Arc::new(PostgresHeartbeatService::new(pg_pool));

    let hostname = application_name.clone();
    heartbeats.sanity_check("transmogrifier", &hostname).await;

    let stop = StopToken::new();
    tokio::spawn(grid_supervisor::watch_signals(stop.clone()));

    let run_once = args.run_once;
    let bulk = args.bulk;

    grid_supervisor::run_sharded_workers(args.threads, move |worker_index, _worker_count| {
        let catalog = catalog.clone();
        let heartbeats = heartbeats.clone();
        let stop = stop.clone();
        let hostname = hostname.clone();
        async move {
            let heartbeat_id = HeartbeatId {
                executable: "transmogrifier".to_string(),
                hostname,
                pid: std::process::id() as i32,
                thread_id: worker_index as u64,
            };
            loop {
                if stop.is_stopped() {
                    return;
                }
                let iteration_start = std::time::Instant::now();
                let assignment = heartbeats.live(&heartbeat_id).await;
                let _counters = transmogrifier::run_iteration(
                    catalog.as_ref(),
                    assignment.assigned_shard,
                    assignment.total_shards,
                    bulk,
                )
                .await;

                if run_once {
                    heartbeats.die(&heartbeat_id).await;
                    return;
                }

                let remaining = ITERATION_FLOOR.saturating_sub(iteration_start.elapsed());
                if !remaining.is_zero() {
                    tokio::select! {
                        _ = tokio::time::sleep(remaining) => {}
                        _ = stop.stopped() => {
                            heartbeats.die(&heartbeat_id).await;
                            return;
                        }
                    }
                }
            }
        }
    })
    .await;

    Ok(())
}
