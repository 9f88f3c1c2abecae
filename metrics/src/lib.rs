use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_histogram, register_int_gauge, Counter,
    CounterVec, Histogram, IntGauge,
};
use std::time::Duration;

lazy_static! {
    // Submission metrics
    pub static ref EXECUTIONS_SUBMITTED_COUNT: Counter = register_counter!(
        "oscar_executions_submitted_count",
        "the number of execution records accepted into the queue"
    )
    .unwrap();
    pub static ref EXECUTIONS_REJECTED_COUNT: CounterVec = register_counter_vec!(
        "oscar_executions_rejected_count",
        "the number of submissions rejected before a record was created",
        &["reason"]
    )
    .unwrap();

    // Orchestrator metrics
    pub static ref QUEUE_DEPTH: IntGauge = register_int_gauge!(
        "oscar_queue_depth",
        "the number of record ids waiting in or held by the queue"
    )
    .unwrap();
    pub static ref RUNNING_TASKS: IntGauge = register_int_gauge!(
        "oscar_running_tasks",
        "the number of tasks currently in the registry"
    )
    .unwrap();
    pub static ref EXECUTIONS_FINISHED_COUNT: CounterVec = register_counter_vec!(
        "oscar_executions_finished_count",
        "the number of executions that reached a terminal status",
        &["status"]
    )
    .unwrap();
    pub static ref EXECUTION_DURATION_SECONDS: Histogram = register_histogram!(
        "oscar_execution_duration_seconds",
        "wall time from start to terminal status",
        vec![1.0, 5.0, 15.0, 60.0, 300.0, 900.0, 3600.0, 14400.0]
    )
    .unwrap();

    // Broadcaster metrics
    pub static ref SUBSCRIBER_COUNT: IntGauge = register_int_gauge!(
        "oscar_subscriber_count",
        "the number of live event subscribers"
    )
    .unwrap();
    pub static ref SUBSCRIBERS_DROPPED_COUNT: Counter = register_counter!(
        "oscar_subscribers_dropped_count",
        "the number of subscribers dropped for not draining their buffer"
    )
    .unwrap();
    pub static ref EVENTS_PUBLISHED_COUNT: CounterVec = register_counter_vec!(
        "oscar_events_published_count",
        "the number of events published to the broadcaster",
        &["event_type"]
    )
    .unwrap();
}

pub fn observe_execution_finished(status: &str, duration: Duration) {
    EXECUTIONS_FINISHED_COUNT
        .with_label_values(&[status])
        .inc();
    EXECUTION_DURATION_SECONDS.observe(duration.as_secs_f64());
}
