mod header;
mod message;
mod reply;
mod util;

pub(crate) use header::OpCode;
pub(crate) use message::{Message, MessageFlags, MessageSection};
pub(crate) use reply::{Query, Reply, ResponseFlags};
pub(crate) use util::next_request_id;
