pub mod barrier;
pub mod cache;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod forwarder;
pub mod listener;
pub mod metrics;
pub mod pool;
pub mod rate_limit;
pub mod reload;
pub mod upstream;

pub use config::Configuration;
pub use dispatch::Balansir;
pub use error::BalansirError;
