use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use setpoint_core::proto::{ChannelFrame, InputType, PlcDataRow, SetpointValue};
use setpoint_core::schedule::format_time_of_day;
use setpoint_core::{
    AcceptAll, ApiClient, CommandChannel, ConnectionState, EditSession, EditState, EditorConfig,
    PlcDataKind, PlcDataStore, RowBuffer, RowStore, ScheduleStore, ScheduleValidator,
};
use time::Date;
use tracing::{info, warn};

use crate::cli::Assignment;

const OPEN_WAIT: Duration = Duration::from_secs(10);

pub async fn show(config: &EditorConfig, kind: PlcDataKind) -> Result<()> {
    let store = plc_store(config, kind)?;
    let rows = store
        .fetch_catalog()
        .await
        .with_context(|| format!("failed to fetch {}", kind.path()))?;
    for row in &rows {
        println!(
            "{:>6}  {:<40}  {}",
            row.id,
            row.label(),
            describe_value(row)
        );
    }
    info!(target = "setpoint::cli", rows = rows.len(), "rows listed");
    Ok(())
}

pub async fn set(config: &EditorConfig, kind: PlcDataKind, assignments: &[Assignment]) -> Result<()> {
    let store = Arc::new(plc_store(config, kind)?);
    let input_types: BTreeMap<i64, InputType> = store
        .fetch_catalog()
        .await
        .context("failed to fetch row catalog")?
        .into_iter()
        .map(|row| (row.id, row.input_type))
        .collect();

    let mut session = EditSession::connect(config, Arc::clone(&store), AcceptAll)
        .await
        .context("failed to open command channel")?;
    if let Some(channel) = session.channel() {
        wait_until_open(channel).await?;
    }

    session.load().await.context("failed to load rows")?;
    for assignment in assignments {
        let Some(input_type) = input_types.get(&assignment.id).copied() else {
            bail!("row {} does not exist", assignment.id);
        };
        let value = SetpointValue::parse(input_type, &assignment.raw)
            .with_context(|| format!("invalid value for row {}", assignment.id))?;
        if !session.edit(assignment.id, value) {
            bail!("row {} disappeared before it could be edited", assignment.id);
        }
    }

    let outcome = session.submit().await;
    session.dispose().await;
    let state = outcome?;
    println!("{}", describe_state(&state));
    if let EditState::Failed(reason) = state {
        bail!("edit failed: {reason:?}");
    }
    Ok(())
}

pub async fn schedule(
    config: &EditorConfig,
    plant_id: i64,
    tenant_db: &str,
    date: Date,
) -> Result<()> {
    let store = ScheduleStore::new(ApiClient::from_config(config), plant_id, tenant_db, date);
    let fetched = store
        .fetch_rows()
        .await
        .context("failed to fetch schedule")?;

    let mut buffer = RowBuffer::new();
    buffer.seed(fetched);
    let validator = ScheduleValidator;
    let invalid = validator.validate(buffer.rows());
    let end_times = validator.end_times(buffer.rows());
    let mut rows = buffer.rows().to_vec();
    validator.sort(&mut rows);

    for row in &rows {
        let slot = &row.local_value;
        let end = end_times
            .get(&row.id)
            .map(|end| format_time_of_day(*end))
            .unwrap_or_else(|| "--:--".to_string());
        let marker = if invalid.contains(&row.id) { "!" } else { " " };
        println!(
            "{marker} #{:<3} {:>8} -> {:<8} grid={:<5} sell={:<5} charge={}/{} discharge={}",
            slot.rec_no,
            slot.start_time,
            end,
            slot.charge_from_grid,
            slot.allow_to_sell,
            slot.charge_power,
            slot.charge_limit,
            slot.discharge_power,
        );
    }

    if !invalid.is_empty() {
        bail!("{} schedule row(s) share a start time", invalid.len());
    }
    Ok(())
}

pub async fn watch(config: &EditorConfig) -> Result<()> {
    let tenant = config.tenant()?;
    let channel = CommandChannel::for_tenant(config, tenant)?;
    info!(target = "setpoint::cli", url = %channel.url(), "watching channel");

    let frames = channel.on_message(|frame| match frame {
        ChannelFrame::CommandResponse(ack) => info!(
            target = "setpoint::cli",
            token = %ack.message_id,
            status = ?ack.status,
            reason = %ack.reason(),
            "command response"
        ),
        other => info!(target = "setpoint::cli", kind = other.kind(), "frame"),
    });

    let mut states = channel.watch_state();
    let state_log = tokio::spawn(async move {
        while states.changed().await.is_ok() {
            let state = *states.borrow_and_update();
            info!(target = "setpoint::cli", ?state, "connection state");
        }
    });

    channel.open().await;
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    channel.close().await;
    frames.abort();
    state_log.abort();
    Ok(())
}

fn plc_store(config: &EditorConfig, kind: PlcDataKind) -> Result<PlcDataStore> {
    let tenant = config.tenant()?;
    Ok(PlcDataStore::new(ApiClient::from_config(config), kind, tenant))
}

async fn wait_until_open(channel: &CommandChannel) -> Result<()> {
    let mut states = channel.watch_state();
    let opened = tokio::time::timeout(
        OPEN_WAIT,
        states.wait_for(|state| *state == ConnectionState::Open),
    )
    .await
    .map(|waited| waited.map(|_| ()));
    match opened {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(_)) => bail!("command channel shut down while connecting"),
        Err(_) => {
            warn!(
                target = "setpoint::cli",
                url = %channel.url(),
                retries = channel.retry_count(),
                "command channel did not open"
            );
            bail!("command channel did not open within {}s", OPEN_WAIT.as_secs())
        }
    }
}

fn describe_value(row: &PlcDataRow) -> String {
    let value = SetpointValue::from_wire(row.input_type, row.data);
    match (value, &row.textlist_entries) {
        (SetpointValue::Code(code), Some(entries)) => match entries.get(&code.to_string()) {
            Some(name) => format!("{name} (#{code})"),
            None => value.to_string(),
        },
        _ => value.to_string(),
    }
}

fn describe_state(state: &EditState) -> String {
    match state {
        EditState::Idle => "idle".to_string(),
        EditState::Sending => "sending".to_string(),
        EditState::Success(kind) => format!("applied ({kind:?})"),
        EditState::Failed(reason) => format!("failed ({reason:?})"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(input_type: InputType, data: Option<f64>) -> PlcDataRow {
        PlcDataRow {
            id: 1,
            plant_id: 1,
            device_id: 4,
            data_id: 12,
            data,
            updated_at: None,
            updated_by: None,
            device_text: None,
            data_text: None,
            input_type,
            textlist_entries: None,
        }
    }

    #[test]
    fn textlist_values_show_their_entry_name() {
        let mut textlist = row(InputType::Textlist, Some(2.0));
        textlist.textlist_entries = Some(BTreeMap::from([
            ("1".to_string(), "Standby".to_string()),
            ("2".to_string(), "Charging".to_string()),
        ]));
        assert_eq!(describe_value(&textlist), "Charging (#2)");

        textlist.data = Some(7.0);
        assert_eq!(describe_value(&textlist), "#7");
    }

    #[test]
    fn plain_values_use_display() {
        assert_eq!(describe_value(&row(InputType::Boolean, Some(1.0))), "on");
        assert_eq!(describe_value(&row(InputType::Number, None)), "-");
    }
}
