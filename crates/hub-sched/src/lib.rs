pub mod ledger;
pub mod mentions;
pub mod scheduler;
pub mod scheduled_runs;

pub use ledger::{Block, HttpLedgerClient, LedgerClient, LedgerPoller};
pub use mentions::{Mention, MentionPoller, MentionSource};
pub use scheduled_runs::SchedulePoller;
pub use scheduler::{JobConfig, JobScheduler};
