//! Management API for a running fleet

pub mod handlers;
pub mod state;

pub use handlers::{create_router, ErrorResponse};
pub use state::AppState;
