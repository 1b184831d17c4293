use std::path::Path;

use crm_core::config::{CrmConfig, DEFAULT_CONFIG_PATH};
use crm_core::ledger::DEFAULT_LEDGER_PATH;
use crm_core::migrate::{DEFAULT_MIGRATION_PATH, MigrationMode, run_migration};
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();
    dotenvy::dotenv().ok();

    println!("Running migration: {DEFAULT_MIGRATION_PATH}");
    let outcome = match CrmConfig::load(Path::new(DEFAULT_CONFIG_PATH)) {
        Ok(config) => run_migration(
            &config,
            Path::new(DEFAULT_MIGRATION_PATH),
            MigrationMode::Batch,
            Some(Path::new(DEFAULT_LEDGER_PATH)),
        ),
        Err(error) => {
            println!("Migration failed: {error}");
            return;
        }
    };

    if outcome.success {
        println!("Migration succeeded: {}", outcome.message);
    } else {
        println!("Migration failed: {}", outcome.message);
    }
}
