//! xsh - run one shell command on many hosts over SSH and report the results

pub mod cancel;
pub mod cli;
pub mod connection;
pub mod credentials;
pub mod error;
pub mod executor;
pub mod logging;
pub mod models;
pub mod output;
pub mod plan;
pub mod results;
pub mod settings;
pub mod transport;
