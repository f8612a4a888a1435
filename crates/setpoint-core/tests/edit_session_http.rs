use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, put};
use axum::{Json, Router};
use parking_lot::Mutex;
use serde_json::json;
use setpoint_core::proto::{
    encode_ack, CommandAck, DataUpdate, ErrorDetail, InputType, PlcDataRow, ScheduleRecord,
    ScheduleSlot, SetpointValue,
};
use setpoint_core::{
    AcceptAll, ApiClient, ConnectionState, EditSession, EditState, EditorConfig, FailureReason,
    PlcDataKind, PlcDataStore, ReconnectPolicy, ScheduleStore, ScheduleValidator, SuccessKind,
    SHUTDOWN_REASON,
};
use time::macros::date;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use uuid::Uuid;

const TENANT: &str = "6f1c1b9e-0a44-4c36-9d43-6b1f3a3f7d21";
const TOKEN: &str = "operator-token";

#[derive(Clone, Copy)]
enum AckMode {
    Ok,
    Busy,
}

#[derive(Clone)]
struct Backend {
    settings: Arc<Mutex<Vec<PlcDataRow>>>,
    schedule: Arc<Mutex<Vec<ScheduleRecord>>>,
    schedule_queries: Arc<Mutex<Vec<HashMap<String, String>>>>,
    puts: Arc<Mutex<Vec<Vec<DataUpdate>>>>,
    auth: Arc<Mutex<Vec<String>>>,
    ack_mode: Arc<Mutex<AckMode>>,
    acks: broadcast::Sender<String>,
    sockets: Arc<AtomicUsize>,
    close_frames: Arc<Mutex<Vec<(u16, String)>>>,
}

impl Backend {
    fn new() -> Self {
        let (acks, _) = broadcast::channel(16);
        Self {
            settings: Arc::new(Mutex::new(vec![
                setting(1, 10.0),
                setting(2, 20.0),
                setting(3, 30.0),
            ])),
            schedule: Arc::new(Mutex::new(vec![
                record(101, slot(1, "00:00:00")),
                record(102, slot(2, "06:00:00")),
            ])),
            schedule_queries: Arc::default(),
            puts: Arc::default(),
            auth: Arc::default(),
            ack_mode: Arc::new(Mutex::new(AckMode::Ok)),
            acks,
            sockets: Arc::default(),
            close_frames: Arc::default(),
        }
    }

    fn record_auth(&self, headers: &HeaderMap) {
        let value = headers
            .get("authorization")
            .and_then(|value| value.to_str().ok())
            .unwrap_or("")
            .to_string();
        self.auth.lock().push(value);
    }
}

fn setting(id: i64, data: f64) -> PlcDataRow {
    PlcDataRow {
        id,
        plant_id: 1,
        device_id: 7,
        data_id: 100 + id,
        data: Some(data),
        updated_at: None,
        updated_by: None,
        device_text: Some("Battery".into()),
        data_text: Some(format!("Limit {id}")),
        input_type: InputType::Number,
        textlist_entries: None,
    }
}

fn slot(rec_no: i64, start_time: &str) -> ScheduleSlot {
    ScheduleSlot {
        rec_no,
        start_time: start_time.into(),
        charge_from_grid: false,
        allow_to_sell: true,
        charge_power: 0.0,
        charge_limit: 95.0,
        discharge_power: 4.0,
        source: 1,
    }
}

fn record(id: i64, slot: ScheduleSlot) -> ScheduleRecord {
    ScheduleRecord {
        id,
        slot,
        updated_at: None,
        updated_by: None,
    }
}

async fn list_settings(
    State(backend): State<Backend>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    backend.record_auth(&headers);
    if query.get("tenant_id").map(String::as_str) != Some(TENANT) {
        return StatusCode::NOT_FOUND.into_response();
    }
    Json(backend.settings.lock().clone()).into_response()
}

async fn update_settings(
    State(backend): State<Backend>,
    headers: HeaderMap,
    Json(updates): Json<Vec<DataUpdate>>,
) -> Response {
    backend.record_auth(&headers);
    if updates
        .iter()
        .any(|update| update.data.map_or(false, |data| data > 1000.0))
    {
        return (StatusCode::INTERNAL_SERVER_ERROR, "limit exceeded").into_response();
    }
    backend.puts.lock().push(updates.clone());

    let mode = *backend.ack_mode.lock();
    let relay = backend.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let ack = match mode {
            AckMode::Ok => {
                let mut rows = relay.settings.lock();
                for update in &updates {
                    if let Some(row) = rows.iter_mut().find(|row| row.id == update.id) {
                        row.data = update.data;
                    }
                }
                CommandAck::ok("abc")
            }
            AckMode::Busy => CommandAck::error("abc", ErrorDetail::Code(-3)),
        };
        let _ = relay.acks.send(encode_ack(&ack));
    });

    (
        StatusCode::ACCEPTED,
        Json(json!({ "message": "PLC data settings update sent", "message_id": "abc" })),
    )
        .into_response()
}

async fn list_schedule(
    State(backend): State<Backend>,
    Query(query): Query<HashMap<String, String>>,
) -> Json<Vec<ScheduleRecord>> {
    backend.schedule_queries.lock().push(query);
    Json(backend.schedule.lock().clone())
}

/// Replaces the whole day: rows are renumbered by start time, non-positive
/// ids are inserted and stored rows missing from the body are deleted.
async fn bulk_schedule(
    State(backend): State<Backend>,
    Json(mut records): Json<Vec<ScheduleRecord>>,
) -> Json<Vec<ScheduleRecord>> {
    let mut stored = backend.schedule.lock();
    records.sort_by(|a, b| a.slot.start_time.cmp(&b.slot.start_time));

    let mut next_id = stored.iter().map(|r| r.id).max().unwrap_or(0) + 1;
    let mut kept = HashSet::new();
    for (index, mut incoming) in records.into_iter().enumerate() {
        incoming.slot.rec_no = index as i64 + 1;
        if incoming.id > 0 {
            kept.insert(incoming.id);
            if let Some(existing) = stored.iter_mut().find(|r| r.id == incoming.id) {
                existing.slot = incoming.slot;
            }
        } else {
            stored.push(record(next_id, incoming.slot));
            kept.insert(next_id);
            next_id += 1;
        }
    }
    stored.retain(|r| kept.contains(&r.id));
    stored.sort_by_key(|r| r.slot.rec_no);
    Json(stored.clone())
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(_tenant): Path<String>,
    State(backend): State<Backend>,
) -> impl IntoResponse {
    // subscribe before the upgrade completes so no ack is missed
    let acks = backend.acks.subscribe();
    backend.sockets.fetch_add(1, Ordering::SeqCst);
    ws.on_upgrade(move |socket| relay_acks(socket, acks, backend))
}

async fn relay_acks(
    mut socket: WebSocket,
    mut acks: broadcast::Receiver<String>,
    backend: Backend,
) {
    loop {
        tokio::select! {
            ack = acks.recv() => match ack {
                Ok(text) => {
                    if socket.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Err(_) => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(frame))) => {
                    if let Some(frame) = frame {
                        backend
                            .close_frames
                            .lock()
                            .push((frame.code, frame.reason.to_string()));
                    }
                    break;
                }
                None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            },
        }
    }
}

async fn spawn_backend(backend: Backend) -> String {
    let _ = tracing_subscriber::fmt::try_init();
    let router = Router::new()
        .route(
            "/api/v1/settings/plc-data-settings",
            get(list_settings).put(update_settings),
        )
        .route("/api/v1/schedule/", get(list_schedule))
        .route("/api/v1/schedule/bulk", put(bulk_schedule))
        .route("/api/v1/ws/:tenant", get(ws_handler))
        .with_state(backend);
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("listener bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });
    format!("http://{addr}")
}

fn config(api_base: String) -> EditorConfig {
    EditorConfig {
        api_base,
        api_prefix: "/api/v1".into(),
        tenant_id: Some(Uuid::parse_str(TENANT).expect("tenant")),
        token: Some(TOKEN.into()),
        ack_timeout: Duration::from_secs(5),
        reconnect: ReconnectPolicy::constant(Duration::from_millis(50)),
        banner_decay: Duration::from_millis(300),
    }
}

async fn settings_session(
    config: &EditorConfig,
) -> EditSession<PlcDataStore, AcceptAll> {
    let store = PlcDataStore::new(
        ApiClient::from_config(config),
        PlcDataKind::Settings,
        config.tenant().expect("tenant"),
    );
    let session = EditSession::connect(config, Arc::new(store), AcceptAll)
        .await
        .expect("connect");
    let mut state = session.channel().expect("channel").watch_state();
    tokio::time::timeout(
        Duration::from_secs(5),
        state.wait_for(|s| *s == ConnectionState::Open),
    )
    .await
    .expect("channel open in time")
    .expect("channel state");
    session
}

#[test_timeout::tokio_timeout_test(30)]
async fn confirmed_edit_round_trips_through_backend() {
    let backend = Backend::new();
    let config = config(spawn_backend(backend.clone()).await);
    let mut session = settings_session(&config).await;

    assert_eq!(session.load().await.expect("load"), 3);
    assert!(session.edit(2, SetpointValue::Number(25.0)));
    let mut states = session.subscribe_state();

    let state = session.submit().await.expect("valid");
    assert_eq!(state, EditState::Success(SuccessKind::Applied));

    assert_eq!(
        backend.puts.lock().clone(),
        vec![vec![DataUpdate {
            id: 2,
            data: Some(25.0)
        }]]
    );
    let row = session.buffer().get(2).expect("row 2");
    assert_eq!(row.server_value, Some(SetpointValue::Number(25.0)));
    assert!(!row.is_dirty());
    assert!(backend
        .auth
        .lock()
        .iter()
        .all(|value| value == &format!("Bearer {TOKEN}")));

    tokio::time::timeout(
        Duration::from_secs(2),
        states.wait_for(|s| *s == EditState::Idle),
    )
    .await
    .expect("banner decays in time")
    .expect("state");

    session.dispose().await;
}

#[test_timeout::tokio_timeout_test(30)]
async fn busy_controller_rejects_edit() {
    let backend = Backend::new();
    *backend.ack_mode.lock() = AckMode::Busy;
    let config = config(spawn_backend(backend.clone()).await);
    let mut session = settings_session(&config).await;

    session.load().await.expect("load");
    session.edit(1, SetpointValue::Number(11.0));
    let state = session.submit().await.expect("valid");
    assert_eq!(
        state,
        EditState::Failed(FailureReason::Rejected(
            "error code -3 (device busy or unable to process)".into()
        ))
    );
    assert!(session.buffer().get(1).expect("row 1").is_dirty());
    assert_eq!(backend.settings.lock()[0].data, Some(10.0));

    session.dispose().await;
}

#[test_timeout::tokio_timeout_test(30)]
async fn server_error_is_a_transport_failure() {
    let backend = Backend::new();
    let config = config(spawn_backend(backend.clone()).await);
    let mut session = settings_session(&config).await;

    session.load().await.expect("load");
    session.edit(3, SetpointValue::Number(5000.0));
    match session.submit().await.expect("valid") {
        EditState::Failed(FailureReason::Transport(message)) => {
            assert!(message.contains("500"), "{message}");
            assert!(message.contains("limit exceeded"), "{message}");
        }
        other => panic!("unexpected state {other:?}"),
    }
    assert!(backend.puts.lock().is_empty());

    session.dispose().await;
}

#[test_timeout::tokio_timeout_test(30)]
async fn schedule_bulk_update_applies_without_acknowledgment() {
    let backend = Backend::new();
    let config = config(spawn_backend(backend.clone()).await);
    let store = ScheduleStore::new(
        ApiClient::from_config(&config),
        42,
        "tenant_db_1",
        date!(2024 - 05 - 01),
    );
    let (_frames, rx) = broadcast::channel(4);
    let mut session = EditSession::with_frames(&config, Arc::new(store), ScheduleValidator, rx);

    assert_eq!(session.load().await.expect("load"), 2);
    let added = session.insert_local(slot(3, "12:00:00"));
    let mut morning = slot(2, "06:00:00");
    morning.charge_power = 3.5;
    assert!(session.edit(102, morning));
    assert!(session.invalid_rows().is_empty());

    let state = session.submit().await.expect("valid");
    assert_eq!(state, EditState::Success(SuccessKind::Applied));
    assert!(added < 0);
    assert_eq!(session.rows().len(), 3);
    assert!(session.rows().iter().all(|row| !row.is_local() && !row.is_dirty()));
    assert_eq!(backend.schedule.lock()[1].slot.charge_power, 3.5);

    let queries = backend.schedule_queries.lock().clone();
    let first = queries.first().expect("schedule query");
    assert_eq!(first.get("plant_id").map(String::as_str), Some("42"));
    assert_eq!(first.get("tenant_db").map(String::as_str), Some("tenant_db_1"));
    assert_eq!(first.get("date").map(String::as_str), Some("2024-05-01"));
}

#[test_timeout::tokio_timeout_test(30)]
async fn one_slot_edit_keeps_the_rest_of_the_day() {
    let backend = Backend::new();
    backend.schedule.lock().push(record(103, slot(3, "18:00:00")));
    let config = config(spawn_backend(backend.clone()).await);
    let store = ScheduleStore::new(
        ApiClient::from_config(&config),
        42,
        "tenant_db_1",
        date!(2024 - 05 - 01),
    );
    let (_frames, rx) = broadcast::channel(4);
    let mut session = EditSession::with_frames(&config, Arc::new(store), ScheduleValidator, rx);

    assert_eq!(session.load().await.expect("load"), 3);
    let mut morning = slot(2, "06:00:00");
    morning.charge_power = 2.25;
    assert!(session.edit(102, morning));

    let state = session.submit().await.expect("valid");
    assert_eq!(state, EditState::Success(SuccessKind::Applied));

    let stored = backend.schedule.lock().clone();
    let ids: Vec<i64> = stored.iter().map(|r| r.id).collect();
    assert_eq!(ids, vec![101, 102, 103]);
    assert_eq!(stored[0].slot, slot(1, "00:00:00"));
    assert_eq!(stored[1].slot.charge_power, 2.25);
    assert_eq!(stored[2].slot, slot(3, "18:00:00"));
    assert_eq!(session.rows().len(), 3);
    assert!(session.rows().iter().all(|row| !row.is_dirty()));
}

#[test_timeout::tokio_timeout_test(30)]
async fn dispose_closes_the_channel_for_good() {
    let backend = Backend::new();
    let config = config(spawn_backend(backend.clone()).await);
    let mut session = settings_session(&config).await;
    session.load().await.expect("load");
    assert_eq!(backend.sockets.load(Ordering::SeqCst), 1);

    session.dispose().await;

    let mut closes = Vec::new();
    for _ in 0..100 {
        closes = backend.close_frames.lock().clone();
        if !closes.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(closes, vec![(1000, SHUTDOWN_REASON.to_string())]);

    // several reconnect intervals pass without a new socket
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(backend.sockets.load(Ordering::SeqCst), 1);
}
