//! Server side request handling: the [`PacketHandler`] dispatcher and the
//! [`Task`]s it queues on the worker pool.

pub use packet_handler::PacketHandler;
pub use task::{
    Task, TaskContext, CREATE_ITEM_ERROR, LOGIN_ERROR, LOGIN_INVALID, NOT_LOGGED_IN,
    PLACE_BID_ERROR, REGISTER_ERROR,
};

mod packet_handler;
mod task;
