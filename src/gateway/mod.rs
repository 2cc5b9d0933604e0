//! HTTP job gateway: submission, polling, cancellation and push events.

mod api;
mod events;
mod server;

pub use api::{ApiError, AppState, CORRELATION_HEADER, SharedState, SubmitResponse, api_router};
pub use events::EventStreamSettings;
pub use server::{build_router, build_state, start_server};
