pub mod bitflip;
pub mod command;
pub mod config;
pub mod engine;
pub mod monitor;
pub mod result_log;
pub mod stats;
pub mod tasks;
pub mod transport;

pub mod prelude {
    pub use crate::command::CommandOutput;
    pub use crate::config::{DeviceConfig, DeviceType, ParameterProfile, TaskKind};
    pub use crate::engine::{Clock, Engine, GlitchOutcome, GlitchParams, GlitchRequest, SystemClock};
    pub use crate::monitor::{IterationResult, KmsgMonitor, Verdict};
    pub use crate::result_log::ResultLog;
    pub use crate::tasks::{create_task, Task};
    pub use crate::transport::{AdbTransport, Transport};
}
