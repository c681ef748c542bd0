pub mod service;

pub use service::ChatService;
