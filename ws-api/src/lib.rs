pub mod auth;
pub mod config;
pub mod error;
pub mod routes;
pub mod state;
pub mod watchdog;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use routes::create_app;
pub use state::AppState;
pub use watchdog::start_watchdog_task;
