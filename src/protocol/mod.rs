//! Coordinator/executor wire protocol

pub mod codec;
pub mod packet;

pub use packet::*;
