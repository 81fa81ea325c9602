mod config;

pub use config::{Config, IdentityConfig, RoomConfig, ServerConfig, StoreConfig, TurnConfig};
