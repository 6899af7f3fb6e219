/*!
Kolosal server: OpenAI-compatible HTTP surface over the engine
lifecycle coordinator, download manager and dynamic backend loader.
*/

pub mod config;
pub mod error;
pub mod routes;
pub mod state;

pub use config::{CliArgs, ServerConfig, ALLOW_CONFIG_SAVE_ENV};
pub use state::AppState;
