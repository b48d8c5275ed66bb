#![deny(unsafe_op_in_unsafe_fn)]

pub mod naive;
pub mod scheduler;

pub use naive::NaiveFlushAndReload;
pub use scheduler::{
    Cadence, RunOutcome, SamplingScheduler, SchedulerConfig, StopReason, StopToken,
};
