pub mod access;
pub mod client;
pub mod config;
pub mod control;
pub mod metrics;
pub mod registry;
pub mod router;
pub mod server;
pub mod state;
pub mod time;

pub use config::Config;
pub use registry::Registry;
