pub mod client;
pub mod config;
pub mod config_validation;
pub mod control;
pub mod correlation;
pub mod errors;
pub mod frontend;
pub mod identity;
pub mod lease;
pub mod logging;
pub mod metrics;
pub mod pacer;
pub mod progress;
pub mod transport;
pub mod utils;
