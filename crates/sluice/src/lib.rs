pub mod chain;
pub mod errorspool;
pub mod runtime;
pub mod steps;

pub use chain::{Chain, ChainBuilder, ChainError, ChainStats, StageCtx, StepError, StepHandle};
pub use errorspool::{ErrorSpool, SpooledError};
pub use runtime::{
    ActiveTransfer, DataFormat, ModeError, Runtime, TransferControls, TransferMode,
};
