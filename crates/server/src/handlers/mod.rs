//! Stateless HTTP surface, backed by the same guard and dispatcher as
//! the live connection.

pub mod messages;
pub mod rooms;

pub use messages::{list_messages, send_message};
pub use rooms::{create_room, get_room, join_room, leave_room, list_rooms};
