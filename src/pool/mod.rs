//! Client side: the `Pool` façade and the handles it returns

pub mod asyncwrap;
pub mod imap;
pub mod lifecycle;
pub mod pool;

pub use asyncwrap::{AsyncResult, Callbacks};
pub use imap::ResultStream;
pub use lifecycle::PoolState;
pub use pool::{Pool, PoolOptions};
