//! HTTP front end of the ingestion worker: liveness and readiness only.

pub mod response;
pub mod routes;
pub mod state;

pub use routes::router;
pub use state::AppState;
