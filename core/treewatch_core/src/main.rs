mod chat;
mod next_water;
mod notify;
mod settings;
mod status_text;
mod tasks;
mod tracker;
mod tree_log;
mod uptime;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use clap::Parser;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    sync::Arc,
    time::Duration,
};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};

use crate::{
    chat::{ChatClient, DiscordRest, DEFAULT_DISCORD_API_BASE},
    notify::NotificationState,
    settings::{
        tz_offset_from_minutes, SettingsError, SettingsStore, MAX_WINDOW_HOURS,
        TZ_OFFSET_MINUTES_MAX, TZ_OFFSET_MINUTES_MIN,
    },
    status_text::IngestControl,
    tasks::{TaskConfig, Tasks},
    tracker::{StatusSignal, Tracker, TrackerError},
    tree_log::{render_csv, Category, TreeLogError, TreeLogStore},
};

const DEFAULT_PORT: u16 = 17700;

#[derive(Parser, Debug)]
#[command(name = "treewatch_core", version)]
struct Args {
    /// Listen address.
    ///
    /// Accepts:
    /// - ip:port (recommended), e.g. 127.0.0.1:17700
    /// - ip (implies port 17700), e.g. 127.0.0.1
    #[arg(long, default_value = "127.0.0.1:17700")]
    listen: String,

    /// SQLite database path (per-guild settings).
    #[arg(long, default_value = "./data/treewatch.db")]
    db: PathBuf,

    /// Directory holding one `<guild_id>.csv` tree log per guild.
    #[arg(long, default_value = "./data/tree_logs")]
    data_dir: PathBuf,

    /// Discord bot token. Without one, outbound messages are disabled.
    #[arg(long, env = "DISCORD_BOT_TOKEN", hide_env_values = true)]
    discord_token: Option<String>,

    /// Discord REST API base URL.
    #[arg(long, default_value = DEFAULT_DISCORD_API_BASE)]
    discord_api_base: String,

    /// Interval of the water notification check (milliseconds).
    #[arg(long, default_value_t = 1000)]
    water_tick_ms: u64,

    /// Pause between guilds during notification cleanup (milliseconds).
    #[arg(long, default_value_t = 10_000)]
    cleanup_pause_ms: u64,
}

#[derive(Clone)]
struct AppState {
    tracker: Arc<Tracker>,
    tasks: Arc<Tasks>,
}

#[derive(Serialize)]
struct OkResponse<T: Serialize> {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
}

#[derive(Serialize)]
struct ErrResponse {
    ok: bool,
    error: &'static str,
}

#[derive(Deserialize)]
struct IngestSignal {
    guild_id: String,
    channel_id: String,
    description: String,
    #[serde(default)]
    footer: Option<String>,
    #[serde(default)]
    controls: Vec<IngestControl>,
    edited_at: String,
}

#[derive(Deserialize)]
struct WindowQuery {
    #[serde(default)]
    hours: Option<i64>,
    #[serde(default)]
    offset: Option<i64>,
    #[serde(default, rename = "type")]
    category: Option<String>,
    #[serde(default)]
    types: Option<String>,
    #[serde(default)]
    tz_offset_minutes: Option<i32>,
}

#[derive(Serialize)]
struct NextWaterView {
    next_time: String,
    last_duration_seconds: i64,
}

#[derive(Serialize)]
struct UptimeView {
    start: String,
    end: String,
    category: Category,
    uptime_seconds: f64,
    downtime_seconds: f64,
    uptime_percent: f64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "treewatch_core=info,tower_http=info".into()),
        )
        .init();

    let args = Args::parse();

    std::fs::create_dir_all(&args.data_dir)?;
    let settings = SettingsStore::open(&args.db)?;
    let logs = Arc::new(TreeLogStore::new(&args.data_dir));
    let discord = DiscordRest::new(&args.discord_api_base, args.discord_token.clone());
    if !discord.is_enabled() {
        warn!("no Discord token configured; notifications will not be delivered");
    }
    let chat: Arc<dyn ChatClient> = Arc::new(discord);
    let tracker = Arc::new(Tracker::new(logs, settings, chat));

    for guild_id in tracker.known_guilds().await? {
        if let Err(err) = tracker.load_guild(&guild_id).await {
            error!(guild_id = %guild_id, "loading guild failed: {err}");
        }
    }

    let tasks = Arc::new(Tasks::new(TaskConfig {
        water_tick: Duration::from_millis(args.water_tick_ms.max(1)),
        cleanup_pause: Duration::from_millis(args.cleanup_pause_ms),
    }));
    tasks.ensure_running(&tracker).await;

    let state = AppState {
        tracker,
        tasks: tasks.clone(),
    };

    let cors = CorsLayer::new()
        .allow_origin(HeaderValue::from_static("*"))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([axum::http::header::CONTENT_TYPE]);

    let app = Router::new()
        .route("/health", get(health))
        .route("/signal", post(post_signal).options(options_ok))
        .route("/guilds/:guild_id/next_water", get(get_next_water))
        .route("/guilds/:guild_id/notifications", get(get_notifications))
        .route("/guilds/:guild_id/uptime", get(get_uptime))
        .route("/guilds/:guild_id/summary", get(get_summary))
        .route("/guilds/:guild_id/logs", get(get_logs))
        .route(
            "/guilds/:guild_id/config/:category",
            get(get_config).post(post_config).options(options_ok),
        )
        .with_state(state)
        .layer(cors);

    let addr = parse_listen(&args.listen)?;
    info!("Core listening on http://{addr}");
    info!("DB: {}", args.db.display());
    info!("Tree logs: {}", args.data_dir.display());

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    tasks.shutdown().await;
    Ok(())
}

fn parse_listen(input: &str) -> anyhow::Result<SocketAddr> {
    if let Ok(addr) = input.parse::<SocketAddr>() {
        return Ok(addr);
    }

    if let Ok(ip) = input.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, DEFAULT_PORT));
    }

    if let Some((host, port_str)) = input.rsplit_once(':') {
        if host == "localhost" {
            let port: u16 = port_str.parse().map_err(|_| {
                anyhow::anyhow!(
                    "invalid --listen '{}': bad port. Example: 127.0.0.1:{}",
                    input,
                    DEFAULT_PORT
                )
            })?;
            return Ok(SocketAddr::new(IpAddr::from([127, 0, 0, 1]), port));
        }
    }

    if input == "localhost" {
        return Ok(SocketAddr::new(IpAddr::from([127, 0, 0, 1]), DEFAULT_PORT));
    }

    Err(anyhow::anyhow!(
        "invalid --listen '{}'. Use ip:port (e.g. 127.0.0.1:{}) or ip (e.g. 127.0.0.1).",
        input,
        DEFAULT_PORT
    ))
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown requested");
}

async fn options_ok() -> impl IntoResponse {
    StatusCode::OK
}

fn err_response(status: StatusCode, error: &'static str) -> Response {
    (status, Json(ErrResponse { ok: false, error })).into_response()
}

fn ok_response<T: Serialize>(data: T) -> Response {
    Json(OkResponse {
        ok: true,
        data: Some(data),
    })
    .into_response()
}

fn tracker_error(err: TrackerError) -> Response {
    error!("{err}");
    match err {
        TrackerError::Log(TreeLogError::Io { .. }) => {
            err_response(StatusCode::INTERNAL_SERVER_ERROR, "log_io_error")
        }
        TrackerError::Settings(_) => err_response(StatusCode::INTERNAL_SERVER_ERROR, "db_error"),
        TrackerError::Window { .. } => err_response(StatusCode::BAD_REQUEST, "invalid_window"),
    }
}

fn is_snowflake(id: &str) -> bool {
    !id.is_empty() && id.len() <= 20 && id.chars().all(|c| c.is_ascii_digit())
}

fn normalize_tz_offset_minutes(v: Option<i32>) -> Option<i32> {
    v.map(|m| m.clamp(TZ_OFFSET_MINUTES_MIN, TZ_OFFSET_MINUTES_MAX))
}

/// `[now - hours - offset, now - offset]`, or an error code for out-of-range input.
fn query_window(
    q: &WindowQuery,
    now: OffsetDateTime,
) -> Result<(OffsetDateTime, OffsetDateTime), &'static str> {
    let hours = q.hours.unwrap_or(24);
    if hours <= 0 || hours > MAX_WINDOW_HOURS {
        return Err("invalid_hours");
    }
    let offset = q.offset.unwrap_or(0);
    if !(0..=MAX_WINDOW_HOURS).contains(&offset) {
        return Err("invalid_offset");
    }
    tracker::window(now, hours, offset).map_err(|_| "invalid_window")
}

fn query_category(q: &WindowQuery) -> Result<Category, &'static str> {
    match q.category.as_deref() {
        None => Ok(Category::Water),
        Some(s) => Category::parse(s).ok_or("invalid_type"),
    }
}

fn query_types(q: &WindowQuery) -> Result<Vec<Category>, &'static str> {
    let Some(raw) = q.types.as_deref() else {
        return Ok(vec![Category::Water]);
    };
    let mut out = Vec::new();
    for part in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let c = Category::parse(part).ok_or("invalid_types")?;
        if !out.contains(&c) {
            out.push(c);
        }
    }
    if out.is_empty() {
        return Err("invalid_types");
    }
    Ok(out)
}

#[derive(Serialize)]
struct HealthInfo {
    service: &'static str,
    version: &'static str,
}

async fn health() -> impl IntoResponse {
    Json(OkResponse {
        ok: true,
        data: Some(HealthInfo {
            service: "treewatch_core",
            version: env!("CARGO_PKG_VERSION"),
        }),
    })
}

async fn post_signal(State(state): State<AppState>, Json(payload): Json<Value>) -> Response {
    let s: IngestSignal = match serde_json::from_value(payload) {
        Ok(v) => v,
        Err(_) => return err_response(StatusCode::BAD_REQUEST, "invalid_json"),
    };
    if !is_snowflake(&s.guild_id) {
        return err_response(StatusCode::BAD_REQUEST, "invalid_guild_id");
    }
    let edited_at = match OffsetDateTime::parse(&s.edited_at, &Rfc3339) {
        Ok(t) => t,
        Err(_) => return err_response(StatusCode::BAD_REQUEST, "invalid_edited_at"),
    };

    // Loops that died since the last signal come back here.
    state.tasks.ensure_running(&state.tracker).await;

    let signal = StatusSignal {
        guild_id: s.guild_id,
        channel_id: s.channel_id,
        description: s.description,
        footer: s.footer,
        controls: s.controls,
        edited_at,
    };
    match state.tracker.handle_signal(&signal).await {
        Ok(report) => ok_response(report),
        Err(err) => tracker_error(err),
    }
}

async fn get_next_water(State(state): State<AppState>, Path(guild_id): Path<String>) -> Response {
    if !is_snowflake(&guild_id) {
        return err_response(StatusCode::BAD_REQUEST, "invalid_guild_id");
    }
    match state.tracker.next_water.peek(&guild_id).await {
        Ok(fact) => ok_response(NextWaterView {
            next_time: fact.next_time.format(&Rfc3339).unwrap_or_default(),
            last_duration_seconds: fact.last_duration.whole_seconds(),
        }),
        Err(err) => tracker_error(err.into()),
    }
}

#[derive(Serialize)]
struct NotificationView {
    category: Category,
    active: bool,
    message_id: Option<String>,
    created_at: Option<String>,
}

async fn get_notifications(State(state): State<AppState>, Path(guild_id): Path<String>) -> Response {
    if !is_snowflake(&guild_id) {
        return err_response(StatusCode::BAD_REQUEST, "invalid_guild_id");
    }
    let mut out = Vec::with_capacity(Category::ALL.len());
    for category in Category::ALL {
        let view = match state.tracker.gate.state(&guild_id, category).await {
            NotificationState::Absent => NotificationView {
                category,
                active: false,
                message_id: None,
                created_at: None,
            },
            NotificationState::Active { handle, created_at } => NotificationView {
                category,
                active: true,
                message_id: Some(handle.message_id),
                created_at: Some(created_at.format(&Rfc3339).unwrap_or_default()),
            },
        };
        out.push(view);
    }
    ok_response(out)
}

async fn get_uptime(
    State(state): State<AppState>,
    Path(guild_id): Path<String>,
    Query(q): Query<WindowQuery>,
) -> Response {
    if !is_snowflake(&guild_id) {
        return err_response(StatusCode::BAD_REQUEST, "invalid_guild_id");
    }
    let (start, end) = match query_window(&q, OffsetDateTime::now_utc()) {
        Ok(w) => w,
        Err(code) => return err_response(StatusCode::BAD_REQUEST, code),
    };
    let category = match query_category(&q) {
        Ok(c) => c,
        Err(code) => return err_response(StatusCode::BAD_REQUEST, code),
    };
    match state.tracker.up_down(&guild_id, start, end, category).await {
        Ok(ud) => ok_response(UptimeView {
            start: start.format(&Rfc3339).unwrap_or_default(),
            end: end.format(&Rfc3339).unwrap_or_default(),
            category,
            uptime_seconds: ud.uptime_seconds,
            downtime_seconds: ud.downtime_seconds,
            uptime_percent: ud.uptime_percent(),
        }),
        Err(err) => tracker_error(err),
    }
}

async fn get_summary(
    State(state): State<AppState>,
    Path(guild_id): Path<String>,
    Query(q): Query<WindowQuery>,
) -> Response {
    if !is_snowflake(&guild_id) {
        return err_response(StatusCode::BAD_REQUEST, "invalid_guild_id");
    }
    let (start, end) = match query_window(&q, OffsetDateTime::now_utc()) {
        Ok(w) => w,
        Err(code) => return err_response(StatusCode::BAD_REQUEST, code),
    };
    let category = match query_category(&q) {
        Ok(c) => c,
        Err(code) => return err_response(StatusCode::BAD_REQUEST, code),
    };
    let tz = normalize_tz_offset_minutes(q.tz_offset_minutes).map(tz_offset_from_minutes);
    match state
        .tracker
        .summary(&guild_id, start, end, category, tz)
        .await
    {
        Ok(report) => ok_response(report),
        Err(err) => tracker_error(err),
    }
}

async fn get_logs(
    State(state): State<AppState>,
    Path(guild_id): Path<String>,
    Query(q): Query<WindowQuery>,
) -> Response {
    if !is_snowflake(&guild_id) {
        return err_response(StatusCode::BAD_REQUEST, "invalid_guild_id");
    }
    let (start, end) = match query_window(&q, OffsetDateTime::now_utc()) {
        Ok(w) => w,
        Err(code) => return err_response(StatusCode::BAD_REQUEST, code),
    };
    let types = match query_types(&q) {
        Ok(t) => t,
        Err(code) => return err_response(StatusCode::BAD_REQUEST, code),
    };
    let events = match state.tracker.events(&guild_id, start, end, &types).await {
        Ok(Some(v)) => v,
        Ok(None) => return err_response(StatusCode::NOT_FOUND, "no_log"),
        Err(err) => return tracker_error(err),
    };
    (
        StatusCode::OK,
        [("content-type", "text/csv; charset=utf-8")],
        render_csv(&events),
    )
        .into_response()
}

fn settings_error(err: SettingsError) -> Response {
    match err {
        SettingsError::UnknownCategory(_) => {
            err_response(StatusCode::NOT_FOUND, "unknown_category")
        }
        SettingsError::Invalid(msg) => {
            warn!("rejected config update: {msg}");
            err_response(StatusCode::BAD_REQUEST, "invalid_config")
        }
        other => tracker_error(other.into()),
    }
}

async fn get_config(
    State(state): State<AppState>,
    Path((guild_id, category)): Path<(String, String)>,
) -> Response {
    if !is_snowflake(&guild_id) {
        return err_response(StatusCode::BAD_REQUEST, "invalid_guild_id");
    }
    match state.tracker.settings.get_json(&guild_id, &category).await {
        Ok(v) => ok_response(v),
        Err(err) => settings_error(err),
    }
}

async fn post_config(
    State(state): State<AppState>,
    Path((guild_id, category)): Path<(String, String)>,
    Json(payload): Json<Value>,
) -> Response {
    if !is_snowflake(&guild_id) {
        return err_response(StatusCode::BAD_REQUEST, "invalid_guild_id");
    }
    let Value::Object(patch) = payload else {
        return err_response(StatusCode::BAD_REQUEST, "invalid_json");
    };
    match state
        .tracker
        .settings
        .update_json(&guild_id, &category, patch)
        .await
    {
        Ok(v) => {
            info!(guild_id = %guild_id, category = %category, "config updated");
            if let Err(err) = state.tracker.config_updated(&guild_id).await {
                warn!(guild_id = %guild_id, "water check not re-armed: {err}");
            }
            ok_response(v)
        }
        Err(err) => settings_error(err),
    }
}
