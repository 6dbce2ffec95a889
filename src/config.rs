//! Command-line and environment configuration.

use crate::auth::{AuthConfig, DEFAULT_PASSWORD_COST, INSECURE_DEFAULT_SECRET};
use clap::Parser;
use std::path::PathBuf;

/// obetrackd - outcome-based-education record sidecar
///
/// Reads one JSON request per line on stdin and answers one JSON response per
/// line on stdout. Logs go to stderr.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Workspace directory to open at startup
    ///
    /// Can also be chosen later with the `workspace.select` method.
    #[arg(long, value_name = "DIR", env = "OBETRACK_WORKSPACE")]
    pub workspace: Option<PathBuf>,

    /// Shared secret used to sign and verify bearer tokens
    #[arg(long, env = "OBETRACK_JWT_SECRET", default_value = INSECURE_DEFAULT_SECRET, hide_default_value = true)]
    pub jwt_secret: String,

    /// Lifetime of issued tokens, in seconds
    #[arg(long, env = "OBETRACK_TOKEN_TTL_SECS", default_value = "86400")]
    pub token_ttl_secs: i64,

    /// Email address that receives the admin role when it signs up
    #[arg(long, value_name = "EMAIL", env = "OBETRACK_BOOTSTRAP_ADMIN")]
    pub bootstrap_admin: Option<String>,

    /// bcrypt cost for newly stored passwords (4..=31)
    #[arg(
        long,
        env = "OBETRACK_PASSWORD_COST",
        default_value_t = DEFAULT_PASSWORD_COST,
        value_parser = clap::value_parser!(u32).range(4..=31)
    )]
    pub password_cost: u32,

    /// Log filter (e.g. info, debug, obetrackd=trace)
    #[arg(long, env = "OBETRACK_LOG", default_value = "info")]
    pub log_level: String,
}

impl Args {
    pub fn auth_config(&self) -> AuthConfig {
        AuthConfig {
            jwt_secret: self.jwt_secret.clone(),
            token_ttl_secs: self.token_ttl_secs,
            bootstrap_admin: self
                .bootstrap_admin
                .as_ref()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty()),
            password_cost: self.password_cost,
        }
    }
}
