//! Errors that stop the worker from starting.

use rootcause::prelude::Report;
use std::fmt;

/// Startup failures. Every variant ends the process.
#[derive(Debug)]
pub enum StartupError {
    /// Configuration is missing or invalid.
    Config { details: String },
    /// The database could not be reached or migrated.
    Database { details: String },
    /// The vault key is unusable.
    Vault { details: String },
    /// A configured provider is invalid.
    Providers { details: String },
    /// The broker was reachable but could not be set up.
    Broker { details: String },
}

impl fmt::Display for StartupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config { details } => write!(f, "invalid configuration: {details}"),
            Self::Database { details } => write!(f, "database setup failed: {details}"),
            Self::Vault { details } => write!(f, "credential vault setup failed: {details}"),
            Self::Providers { details } => write!(f, "provider setup failed: {details}"),
            Self::Broker { details } => write!(f, "broker setup failed: {details}"),
        }
    }
}

impl std::error::Error for StartupError {}

impl From<Report<config::ConfigError>> for StartupError {
    fn from(report: Report<config::ConfigError>) -> Self {
        Self::Config {
            details: report.to_string(),
        }
    }
}
