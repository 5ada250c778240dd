pub mod core;
pub mod email;
pub mod notifications;
#[cfg(feature = "tasks")]
pub mod tasks;
pub mod tickets;

pub use crate::core::config::AppConfig;
pub use crate::core::shared::state::AppState;
