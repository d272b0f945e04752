pub mod api;
pub mod api_v2;
pub mod broker_api;
pub mod config;
pub mod infrastructure;
pub mod metrics;
pub mod server;

pub use config::Config;
pub use infrastructure::ShutdownCoordinator;
