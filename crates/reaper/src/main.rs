use anyhow::Context;
use clap::Parser;
use derivative::Derivative;
use grid_catalog::postgres::PostgresCatalogGateway;
use grid_storage::DriverRegistry;
use grid_supervisor::StopToken;
use reaper::ReaperConfig;

/// Reaper walks storage endpoints whose free-space budget is exhausted and
/// deletes expired, unlocked replicas through the storage protocol driver.
#[derive(Derivative, Parser)]
#[derivative(Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    #[derivative(Debug = "ignore")]
    #[clap(long = "database", env = "DATABASE_URL")]
    database_url: url::Url,
    /// Number of RSE partitions to run in this process.
    #[clap(long = "total-workers", default_value = "1", env = "REAPER_TOTAL_WORKERS")]
    total_workers: u32,
    /// Replica batch size per delete transaction.
    #[clap(long = "chunk-size", default_value = "100")]
    chunk_size: usize,
    /// Ignore the usage/free-space budget; delete any reapable replica.
    #[clap(long)]
    greedy: bool,
    /// Force this protocol scheme instead of picking the RSE's first one.
    #[clap(long)]
    scheme: Option<String>,
    /// Restrict this process to the listed RSE names (comma-separated).
    #[clap(long, value_delimiter = ',')]
    rses: Vec<String>,
    /// Run a single iteration and exit.
    #[clap(long)]
    run_once: bool,
    /// Whether the process may use native protocol client libraries, or
    /// only the in-process mock driver.
    #[clap(long, env = "NATIVE_PROTOCOL_LIBS")]
    native_protocol_libs: bool,
}

const ITERATION_SLEEP_SECS: u64 = 60;

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
    let application_name = std::env::var("HOSTNAME").unwrap_or_else(|_| "reaper".to_string());
    let mut pg_options = args
        .database_url
        .as_str()
        .parse::<sqlx::postgres::PgConnectOptions>()
        .context("parsing database URL")?
        .application_name(&application_name);
    pg_options = pg_options.ssl_mode(sqlx::postgres::PgSslMode::Prefer);

    let pg_pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(args.total_workers.max(1) + 2)
        .connect_with(pg_options)
        .await
        .context("connecting to database")?;

    let catalog = std::sync::Arc::new(PostgresCatalogGateway::new(pg_pool));

    let mut registry = DriverRegistry::new(args.native_protocol_libs);
    registry.register_mock("mock", "mock.Default");
    let registry = std::sync::Arc::new(registry);

    let universe = catalog.list_rses().await.context("listing RSEs")?;
    let rses = reaper::select_rses(universe, &args.rses);
    let partitions = reaper::partition_rses(&rses, args.total_workers);

    let stop = StopToken::new();
    tokio::spawn(grid_supervisor::watch_signals(stop.clone()));

    let config = ReaperConfig {
        chunk_size: args.chunk_size,
        greedy: args.greedy,
        scheme: args.scheme.clone(),
    };
    let run_once = args.run_once;

    grid_supervisor::run_partitioned_workers(partitions, move |partition| {
        let catalog = catalog.clone();
        let registry = registry.clone();
        let stop = stop.clone();
        let config = config.clone();
        async move {
            loop {
                if stop.is_stopped() {
                    return;
                }
                reaper::run_iteration(catalog.as_ref(), registry.as_ref(), &partition, &config).await;
                if run_once {
                    return;
                }
                tokio::select! {
                    _ = tokio::time::sleep(std::time::Duration::from_secs(ITERATION_SLEEP_SECS)) => {}
                    _ = stop.stopped() => return,
                }
            }
        }
    })
    .await;

    Ok(())
}
