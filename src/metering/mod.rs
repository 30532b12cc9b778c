//! Call metering: session lifecycle, spam cooldowns, and the periodic
//! billing scheduler.

pub mod calls;
pub mod cooldown;
pub mod scheduler;

pub use calls::{CallError, CallService};
pub use cooldown::CooldownCache;
pub use scheduler::{MeteringScheduler, TickSummary};
