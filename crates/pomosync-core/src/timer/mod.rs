//! Session timer: pure state machine, persistence service and tick driver.

mod driver;
mod machine;
mod policy;
mod service;
mod session;

pub use driver::{
    run_driver, spawn_driver, IntervalTicker, Ticker, TimerCommand, TimerHandle, TimerOutcome,
    TimerRequest,
};
pub use machine::{TimerSnapshot, TimerState, TimerStateMachine, TimerView};
pub use policy::TimerPolicy;
pub use service::{TimerService, SNAPSHOT_KEY};
pub use session::{PauseInterval, SessionKind, TimerMode, TimerSession};
