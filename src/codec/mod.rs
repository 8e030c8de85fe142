//! Wire framing: JSON message shapes and their decode/encode errors.

pub mod errors;
pub mod message;

pub use errors::FrameError;
pub use message::{NodeInfo, TunnelMessage};
