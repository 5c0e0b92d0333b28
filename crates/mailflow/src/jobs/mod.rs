pub mod clock;
pub mod memory;
pub mod model;
pub mod repo;
pub mod retry;
pub mod runner;
pub mod scheduler;
pub mod store;
pub mod worker;

pub use clock::{Clock, ManualClock, SystemClock};
pub use memory::MemoryStore;
pub use model::{Job, JobState, Lease, NackOutcome, NewJob, StateCounts};
pub use repo::PgJobsRepo;
pub use runner::{JobOutcome, JobRunner};
pub use scheduler::Scheduler;
pub use store::JobStore;
pub use worker::{BatchReport, Worker, WorkerConfig};
