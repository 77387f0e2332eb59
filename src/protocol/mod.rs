pub mod command;
pub mod resp;

pub use command::{classify, CommandCodec, CommandFrame, Disposition};
pub use resp::{copy_reply, parse_int};
