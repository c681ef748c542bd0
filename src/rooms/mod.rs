pub mod registry;
pub mod room;
pub mod service;

pub use registry::{LeftRoom, RoomRegistry};
pub use room::{Room, RoomSummary, generate_room_code};
pub use service::RoomService;
