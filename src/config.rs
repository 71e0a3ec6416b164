pub mod settings;
pub mod user;

pub use settings::{
    ConfigError, ConfigResult, DEFAULT_BIND, DEFAULT_REQUEST_QUEUE, ReplyStrategy, Settings,
    WorkerSettings,
};
pub use user::{load_settings, user_config_path};
