pub mod guard;
pub mod jobs;

pub use guard::StageGuards;
pub use jobs::{JobContext, JobHandle, Scheduler};
