mod context;
mod queue;
mod report;
mod retry;
mod worker;

pub use context::JobWorkerContext;
pub use queue::{enqueue_job, wait_for_job_completion};
pub use report::{
    PipelineError, RenderReportPayload, enqueue_render_report, process_render_report_job,
};
pub use retry::RetryPolicy;
pub use worker::{WorkerPool, WorkerPoolSettings, handle_job};
