use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use setpoint_core::{EditorConfig, PlcDataKind};
use time::macros::format_description;
use time::Date;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(
    name = "setpoint",
    author,
    version,
    about = "Read and edit PLC setpoints applied through the command channel"
)]
pub struct Cli {
    /// Origin of the REST API; the channel URL is derived from it.
    #[arg(long, env = "SETPOINT_API_BASE", global = true)]
    pub api_base: Option<String>,

    /// Tenant whose rows and command channel are used.
    #[arg(long, env = "SETPOINT_TENANT_ID", global = true)]
    pub tenant_id: Option<Uuid>,

    /// Bearer token sent with every request.
    #[arg(long, env = "SETPOINT_TOKEN", global = true, hide_env_values = true)]
    pub token: Option<String>,

    /// Tracing filter directives.
    #[arg(long, env = "RUST_LOG", default_value = "info", global = true)]
    pub log_filter: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Print the current rows
    Show {
        #[arg(value_enum)]
        target: Target,
    },
    /// Change one or more rows and wait for the controller to acknowledge
    Set {
        #[arg(value_enum)]
        target: Target,

        /// Edits as ID=VALUE; an empty VALUE clears the row.
        #[arg(required = true, value_parser = parse_assignment)]
        assignments: Vec<Assignment>,
    },
    /// Print a day's schedule with derived end times and flag conflicts
    Schedule {
        #[arg(long)]
        plant_id: i64,

        #[arg(long)]
        tenant_db: String,

        /// Day in YYYY-MM-DD form.
        #[arg(long, value_parser = parse_date)]
        date: Date,
    },
    /// Log every frame received on the tenant channel until interrupted
    Watch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Target {
    Settings,
    Control,
}

impl From<Target> for PlcDataKind {
    fn from(target: Target) -> Self {
        match target {
            Target::Settings => PlcDataKind::Settings,
            Target::Control => PlcDataKind::Control,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub id: i64,
    pub raw: String,
}

fn parse_assignment(input: &str) -> Result<Assignment, String> {
    let (id, raw) = input
        .split_once('=')
        .ok_or_else(|| format!("`{input}` is not of the form ID=VALUE"))?;
    let id = id
        .trim()
        .parse::<i64>()
        .map_err(|_| format!("`{id}` is not a row id"))?;
    Ok(Assignment {
        id,
        raw: raw.to_string(),
    })
}

fn parse_date(input: &str) -> Result<Date, String> {
    Date::parse(input, format_description!("[year]-[month]-[day]"))
        .map_err(|err| format!("`{input}` is not a date: {err}"))
}

impl Cli {
    /// Environment defaults with command-line flags layered on top.
    pub fn editor_config(&self) -> Result<EditorConfig> {
        let mut config = EditorConfig::from_env().context("invalid SETPOINT_* environment")?;
        if let Some(api_base) = &self.api_base {
            config.api_base = api_base.clone();
        }
        if let Some(tenant_id) = self.tenant_id {
            config.tenant_id = Some(tenant_id);
        }
        if let Some(token) = &self.token {
            config.token = Some(token.clone());
        }
        Ok(config)
    }
}
