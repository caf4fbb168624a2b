mod config;

use services::{Clock, ExamServices};
use tracing_subscriber::EnvFilter;

use crate::config::{Invocation, SweeperConfig, prepare_sqlite_file, print_usage};

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,sqlx=warn"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// One sweep pass; schedule the binary (cron, systemd timer) to run it periodically.
async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = match SweeperConfig::load() {
        Ok(Invocation::Run(config)) => config,
        Ok(Invocation::Help) => {
            print_usage();
            return Ok(());
        }
        Err(err) => {
            eprintln!("{err}");
            print_usage();
            return Err(err.into());
        }
    };
    init_tracing();

    prepare_sqlite_file(&config.db_url)?;
    let clock = config.now.map_or(Clock::Default, Clock::fixed);
    let services = ExamServices::new_sqlite(&config.db_url, clock, config.policy()).await?;

    tracing::info!(db_url = %config.db_url, limit = config.limit, "expiry sweep starting");
    let report = services.sweep().run_once(config.limit).await?;
    println!(
        "expired {} of {} overdue attempts ({} already finished, {} failed)",
        report.expired, report.scanned, report.already_finished, report.failed
    );
    Ok(())
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("{err}");
        std::process::exit(2);
    }
}
