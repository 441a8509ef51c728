//! HTTP surface: route wiring plus one handler module per endpoint
//! family, sharing `AppState`.

pub mod admin;
pub mod forward;
pub mod health;
pub mod models;
pub mod router;
pub mod state;
pub mod transcription;
pub mod usage;

pub use router::build;
pub use state::AppState;
