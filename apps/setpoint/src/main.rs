mod cli;
mod commands;
mod telemetry;

use anyhow::Result;
use clap::Parser;

use crate::cli::{Cli, Command};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    telemetry::init_tracing(&cli.log_filter);
    let config = cli.editor_config()?;

    match cli.command {
        Command::Show { target } => commands::show(&config, target.into()).await,
        Command::Set {
            target,
            assignments,
        } => commands::set(&config, target.into(), &assignments).await,
        Command::Schedule {
            plant_id,
            tenant_db,
            date,
        } => commands::schedule(&config, plant_id, &tenant_db, date).await,
        Command::Watch => commands::watch(&config).await,
    }
}
