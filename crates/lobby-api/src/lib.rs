pub mod auth;
pub mod error;
pub mod messages;
pub mod middleware;
pub mod rooms;

pub use auth::{AppState, AppStateInner};
pub use error::ApiError;
