pub mod render;

pub use render::{
    RenderDocument, RenderJobRequest, RenderRecord, RenderScope, RenderStatus, SubmitResponse,
    OPTIMISTIC_ID_PREFIX,
};
