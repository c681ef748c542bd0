pub mod api;
pub mod chat;
pub mod config;
pub mod error;
pub mod rooms;
pub mod ws;

pub use error::HubError;
