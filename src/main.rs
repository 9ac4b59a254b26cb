use clap::Parser;
use mysql_capture::mysql::MysqlDatabase;
use mysql_capture::output::StdoutOutput;
use mysql_capture::state::{PersistentState, StateStore};
use mysql_capture::{Capture, Config, Result};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Parser, Debug)]
#[command(name = "mysql-capture")]
#[command(about = "MySQL change-data-capture engine", long_about = None)]
#[command(version)]
struct Args {
    #[arg(short, long, help = "Enable JSON output for logs")]
    json_logs: bool,

    #[arg(short, long, help = "Verbose logging")]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(args.json_logs, args.verbose);

    info!("Starting mysql-capture v{}", env!("CARGO_PKG_VERSION"));
    info!("Loading configuration from environment variables");

    let config = match Config::from_env() {
        Ok(cfg) => {
            info!("Configuration loaded successfully");
            cfg
        }
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            eprintln!("\nRequired environment variables:");
            eprintln!("  MYSQL_DATABASE   - MySQL database name");
            eprintln!("  MYSQL_USERNAME   - MySQL username");
            eprintln!("  MYSQL_PASSWORD   - MySQL password");
            eprintln!("  CAPTURE_TABLES   - Comma-separated schema.table[:key] bindings");
            std::process::exit(1);
        }
    };

    info!(
        mysql_host = %config.mysql.host,
        mysql_port = %config.mysql.port,
        mysql_database = %config.mysql.database,
        watermarks_table = %config.capture.watermarks_table,
        tables = ?config.capture.bindings,
        "Configuration summary"
    );

    let state = match &config.capture.state_file {
        Some(path) => StateStore::new(path).load().await?.unwrap_or_default(),
        None => PersistentState::default(),
    };
    if !state.cursor.is_empty() {
        info!(cursor = %state.cursor, "resuming from persisted state");
    }

    let db = MysqlDatabase::connect(&config.mysql, &config.capture.watermarks_table).await?;

    let mut capture = Capture::new(db, &config.capture, state, Box::new(StdoutOutput::new()));

    match capture.run().await {
        Ok(()) => {
            info!("Capture completed successfully");
            Ok(())
        }
        Err(e) => {
            error!("Capture failed: {}", e);
            Err(e)
        }
    }
}

fn init_logging(json: bool, verbose: bool) {
    let env_filter = if verbose {
        EnvFilter::new("mysql_capture=debug,info")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("mysql_capture=info,warn"))
    };

    // Records and checkpoints own stdout; logs go to stderr.
    let fmt_layer = if json {
        tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(false)
            .with_span_list(false)
            .with_writer(std::io::stderr)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .with_writer(std::io::stderr)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
