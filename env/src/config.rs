//! Configuration of application
//!
//! A config file is optional; every knob can also come from the
//! environment, which takes precedence over the file.

use std::path::{Path, PathBuf};

use serde::Deserialize;

fn default_port() -> u16 {
    8080
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_data_file() -> String {
    "state.json".into()
}

fn default_store_backend() -> String {
    "file".into()
}

fn default_ws_base_url() -> String {
    "ws://localhost:8080".into()
}

fn default_session_idle_ttl_ms() -> u64 {
    30 * 60 * 1000
}

fn default_room_active_window_ms() -> u64 {
    5 * 60 * 1000
}

fn default_max_human_players() -> u32 {
    8
}

fn default_public_room_base_count() -> u32 {
    3
}

fn default_public_room_min_joinable() -> usize {
    6
}

fn default_overflow_empty_ttl_ms() -> u64 {
    10 * 60 * 1000
}

fn default_stale_participant_ms() -> u64 {
    2 * 60 * 1000
}

fn default_public_room_code_prefix() -> String {
    "LBY".into()
}

fn default_turn_timeout_ms() -> u64 {
    60_000
}

fn default_turn_timeout_warning_ms() -> u64 {
    10_000
}

fn default_identity_mode() -> String {
    "auto".into()
}

fn default_identity_timeout_ms() -> u64 {
    7_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_ws_base_url")]
    pub ws_base_url: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            ws_base_url: default_ws_base_url(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_backend")]
    pub backend: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_data_file")]
    pub data_file: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_store_backend(),
            data_dir: default_data_dir(),
            data_file: default_data_file(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RoomConfig {
    #[serde(default = "default_session_idle_ttl_ms")]
    pub session_idle_ttl_ms: u64,
    #[serde(default = "default_room_active_window_ms")]
    pub active_window_ms: u64,
    #[serde(default = "default_max_human_players")]
    pub max_human_players: u32,
    #[serde(default = "default_public_room_base_count")]
    pub public_room_base_count: u32,
    #[serde(default = "default_public_room_min_joinable")]
    pub public_room_min_joinable: usize,
    #[serde(default = "default_overflow_empty_ttl_ms")]
    pub public_room_overflow_empty_ttl_ms: u64,
    #[serde(default = "default_stale_participant_ms")]
    pub public_room_stale_participant_ms: u64,
    #[serde(default = "default_public_room_code_prefix")]
    pub public_room_code_prefix: String,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            session_idle_ttl_ms: default_session_idle_ttl_ms(),
            active_window_ms: default_room_active_window_ms(),
            max_human_players: default_max_human_players(),
            public_room_base_count: default_public_room_base_count(),
            public_room_min_joinable: default_public_room_min_joinable(),
            public_room_overflow_empty_ttl_ms: default_overflow_empty_ttl_ms(),
            public_room_stale_participant_ms: default_stale_participant_ms(),
            public_room_code_prefix: default_public_room_code_prefix(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TurnConfig {
    #[serde(default = "default_turn_timeout_ms")]
    pub turn_timeout_ms: u64,
    #[serde(default = "default_turn_timeout_warning_ms")]
    pub turn_timeout_warning_ms: u64,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            turn_timeout_ms: default_turn_timeout_ms(),
            turn_timeout_warning_ms: default_turn_timeout_warning_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct IdentityConfig {
    /// "strict-native", "fallback-http" or "auto".
    #[serde(default = "default_identity_mode")]
    pub mode: String,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub verify_url: Option<String>,
    #[serde(default = "default_identity_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            mode: default_identity_mode(),
            project_id: None,
            verify_url: None,
            timeout_ms: default_identity_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub rooms: RoomConfig,
    #[serde(default)]
    pub turns: TurnConfig,
    #[serde(default)]
    pub identity: IdentityConfig,
}

impl Config {
    pub fn from_path(path: &Path) -> Config {
        tracing::info!("Load configuration: {:?}", path);
        let mut config = match std::fs::read_to_string(path) {
            Ok(text) => match toml::from_str(&text) {
                Ok(config) => config,
                Err(e) => panic!("Invalid config file: {:?}", e.to_string()),
            },
            Err(e) => panic!("Config file not found: {:?}", e.to_string()),
        };
        apply_env(&mut config);
        config
    }

    /// Defaults plus environment overrides, for running without a file.
    pub fn from_env() -> Config {
        let mut config = Config::default();
        apply_env(&mut config);
        config
    }
}

fn env_var<T: std::str::FromStr>(name: &str) -> Option<T> {
    match std::env::var(name) {
        Ok(raw) => match raw.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!("Ignoring unparsable environment variable {}", name);
                None
            }
        },
        Err(_) => None,
    }
}

fn apply_env(config: &mut Config) {
    if let Some(port) = env_var("PORT") {
        config.server.port = port;
    }
    if let Some(url) = env_var("WS_BASE_URL") {
        config.server.ws_base_url = url;
    }
    if let Some(backend) = env_var::<String>("API_STORE_BACKEND") {
        config.store.backend = backend;
    }
    if let Some(dir) = env_var::<String>("API_DATA_DIR") {
        config.store.data_dir = PathBuf::from(dir);
    }
    if let Some(file) = env_var("API_DATA_FILE") {
        config.store.data_file = file;
    }
    if let Some(v) = env_var("MULTIPLAYER_SESSION_IDLE_TTL_MS") {
        config.rooms.session_idle_ttl_ms = v;
    }
    if let Some(v) = env_var("MULTIPLAYER_ROOM_ACTIVE_WINDOW_MS") {
        config.rooms.active_window_ms = v;
    }
    if let Some(v) = env_var("MULTIPLAYER_MAX_HUMAN_PLAYERS") {
        config.rooms.max_human_players = v;
    }
    if let Some(v) = env_var("PUBLIC_ROOM_BASE_COUNT") {
        config.rooms.public_room_base_count = v;
    }
    if let Some(v) = env_var("PUBLIC_ROOM_MIN_JOINABLE") {
        config.rooms.public_room_min_joinable = v;
    }
    if let Some(v) = env_var("PUBLIC_ROOM_OVERFLOW_EMPTY_TTL_MS") {
        config.rooms.public_room_overflow_empty_ttl_ms = v;
    }
    if let Some(v) = env_var("PUBLIC_ROOM_STALE_PARTICIPANT_MS") {
        config.rooms.public_room_stale_participant_ms = v;
    }
    if let Some(v) = env_var("PUBLIC_ROOM_CODE_PREFIX") {
        config.rooms.public_room_code_prefix = v;
    }
    if let Some(v) = env_var("TURN_TIMEOUT_MS") {
        config.turns.turn_timeout_ms = v;
    }
    if let Some(v) = env_var("TURN_TIMEOUT_WARNING_MS") {
        config.turns.turn_timeout_warning_ms = v;
    }
    if let Some(v) = env_var("IDENTITY_MODE") {
        config.identity.mode = v;
    }
    if let Some(v) = env_var("IDENTITY_PROJECT_ID") {
        config.identity.project_id = Some(v);
    }
    if let Some(v) = env_var("IDENTITY_VERIFY_URL") {
        config.identity.verify_url = Some(v);
    }
    if let Some(v) = env_var("IDENTITY_TIMEOUT_MS") {
        config.identity.timeout_ms = v;
    }
}
