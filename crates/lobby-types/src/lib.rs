pub mod api;
pub mod close;
pub mod events;
pub mod models;
