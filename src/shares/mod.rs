mod backend;
pub(crate) mod pipeline;

pub use backend::{Backend, RedisBackend};
pub use pipeline::{SharePipeline, SubmitOrigin, Submission};
