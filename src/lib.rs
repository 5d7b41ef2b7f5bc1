#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]

//! ctun library — the cluster tunnel gateway's building blocks.
//!
//! - `protocol` — JSON frame schema of the control connection
//! - `tunnel` — master-side manager and slave-side client
//! - `forward` — routing middleware (local vs. forwarded handling)
//! - `routes` — cluster status API and the local reverse proxy
//! - `ws` — user-facing `/ws` and `/shell` endpoints
//! - `auth` — API key middleware for the admin surface
//! - `config` — TOML + env-var configuration

pub mod auth;
pub mod config;
pub mod forward;
pub mod protocol;
pub mod routes;
pub mod state;
pub mod tunnel;
pub mod util;
pub mod ws;

// Re-export key types at crate root for convenience.
pub use auth::ApiKey;
pub use config::{Config, DeploymentMode};
pub use state::AppState;
pub use tunnel::manager::TunnelManager;
