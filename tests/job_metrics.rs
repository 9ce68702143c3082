use std::{collections::HashSet, sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use folio::{
    application::{
        convert::{ConvertError, DocumentConverter},
        jobs::{JobWorkerContext, RetryPolicy, handle_job},
        render::{AskamaTemplateRenderer, TemplateId},
        repos::JobQueue,
        scheduler::Scheduler,
    },
    domain::{
        schedule::{ScheduleEntry, ScheduleRule, TaskTemplate},
        types::TaskType,
    },
    infra::{
        memory::{MemoryArtifactStore, MemoryJobQueue, MemoryScheduleStore},
        telemetry::{
            METRIC_JOBS_ACKED, METRIC_JOBS_DEAD_LETTERED, METRIC_JOBS_ENQUEUED,
            METRIC_SCHEDULER_FIRED,
        },
    },
};
use metrics_util::debugging::DebuggingRecorder;
use serde_json::json;
use time::macros::datetime;

struct StaticConverter;

#[async_trait]
impl DocumentConverter for StaticConverter {
    async fn convert(&self, _html: &str) -> Result<Bytes, ConvertError> {
        Ok(Bytes::from_static(b"%PDF-1.7"))
    }
}

#[tokio::test]
async fn job_lifecycle_emits_expected_metric_keys() {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder
        .install()
        .expect("debug metrics recorder should install in this test process");

    let queue = Arc::new(MemoryJobQueue::new(
        Duration::from_secs(30),
        Duration::from_millis(5),
    ));
    let context = JobWorkerContext {
        queue: queue.clone(),
        artifacts: Arc::new(MemoryArtifactStore::new()),
        renderer: Arc::new(AskamaTemplateRenderer::new("Folio")),
        converter: Arc::new(StaticConverter),
        retry: RetryPolicy::default(),
        default_template: TemplateId::PropertySummary,
        settle_margin: Duration::from_secs(1),
    };

    let entries = vec![
        ScheduleEntry {
            schedule_id: "good".to_string(),
            rule: ScheduleRule::interval("good", 60).expect("interval"),
            task_template: TaskTemplate {
                task_type: TaskType::RenderReport,
                payload: json!({ "sku": "P-1" }),
                max_attempts: 2,
            },
            last_fired_at: None,
            enabled: true,
        },
        ScheduleEntry {
            schedule_id: "broken".to_string(),
            rule: ScheduleRule::interval("broken", 60).expect("interval"),
            task_template: TaskTemplate {
                task_type: TaskType::RenderReport,
                payload: json!({ "title": "missing reference" }),
                max_attempts: 2,
            },
            last_fired_at: None,
            enabled: true,
        },
    ];
    let mut scheduler = Scheduler::load(
        entries,
        queue.clone(),
        Arc::new(MemoryScheduleStore::new()),
        datetime!(2026-10-18 09:00:00 UTC),
    )
    .await
    .expect("scheduler");
    assert_eq!(
        scheduler
            .tick_at(datetime!(2026-10-18 09:00:00 UTC))
            .await
            .len(),
        2
    );

    while let Some(job) = queue
        .dequeue("metrics-worker", Duration::from_millis(20))
        .await
        .expect("dequeue")
    {
        handle_job(&context, "metrics-worker", job).await;
    }

    let names: HashSet<String> = snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .map(|(composite_key, _, _, _)| composite_key.key().name().to_string())
        .collect();

    for metric in [
        METRIC_JOBS_ENQUEUED,
        METRIC_JOBS_ACKED,
        METRIC_JOBS_DEAD_LETTERED,
        METRIC_SCHEDULER_FIRED,
    ] {
        assert!(names.contains(metric), "missing metric: {metric}");
    }
}
