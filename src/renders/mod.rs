pub mod backend;
pub mod engine;
pub mod equality;
pub mod state;
pub mod supervisor;

pub use backend::{JobSubmitter, RenderStore};
pub use engine::{RenderEngine, SubmitOutcome};
pub use equality::sequence_equals;
pub use state::{ReconcileOutcome, ReconciliationState, SubmitRejection};
pub use supervisor::{PollExit, PollTick, PollTiming, PollingSupervisor};
