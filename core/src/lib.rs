pub mod auth;
pub mod client;
pub mod config;
pub mod error;
pub mod gateway;
pub mod history;
pub mod refresh;
pub mod sse;
pub mod stats;
pub mod stream;
pub mod telemetry;

pub use auth::{AuthSession, AuthState, UserIdentity};
pub use client::ApiClient;
pub use config::{ClientSettings, ConfigError};
pub use error::{ApiError, RefreshError, StreamError};
pub use gateway::{ApiRequest, RequestGateway};
pub use history::HistoryBuffer;
pub use refresh::{RefreshCoordinator, TokenRefresher};
pub use stats::{StreamSample, SystemInfo, SystemStats};
pub use stream::{
    Clock, ManualClock, StreamConnectionState, StreamConnector, StreamOptions, StreamingClient,
};
