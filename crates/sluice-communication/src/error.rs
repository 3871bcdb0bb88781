use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("pool item size must be > 0")]
    ZeroBlockSize,
    #[error("pool chunk size must be > 0")]
    ZeroChunkSize,
    #[error("pool exhausted ({allocated} blocks allocated, cap {cap})")]
    Exhausted { allocated: usize, cap: usize },
}
