//! HTTP facade over environment provisioning and deployment reconciliation.

pub mod handlers;
pub mod state;

pub use handlers::create_router;
pub use state::AppState;
