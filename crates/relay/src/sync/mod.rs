mod locks;
pub mod pipeline;

pub use locks::DocLocks;
pub use pipeline::{SubmitError, SubmitOutcome, SubmitPipeline};
