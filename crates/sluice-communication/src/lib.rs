mod block;
mod bqueue;
mod error;
mod hub;
mod pool;

pub use block::Block;
pub use bqueue::{Bqueue, QueueState};
pub use error::PoolError;
pub use hub::BroadcastHub;
pub use pool::BlockPool;
