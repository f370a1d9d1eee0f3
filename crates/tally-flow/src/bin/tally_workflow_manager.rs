//! Workflow manager for the tally aggregation pipeline.
//!
//! Looks for batches to be processed in an ingestor bucket and schedules
//! intake tasks for them, then looks for batches validated by both parties
//! and schedules aggregation tasks. Designed to be invoked periodically;
//! overlapping invocations are safe.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::Context as _;
use chrono::Duration;
use clap::{Parser, ValueEnum};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;

use tally_core::clock::SystemClock;
use tally_core::observability::{init_logging, LogFormat};
use tally_core::storage::Bucket;
use tally_flow::dispatch::Enqueuer;
use tally_flow::kubernetes::{JobLister, KubernetesJobLister};
use tally_flow::scheduler::{ScheduleConfig, ScheduleInputs, WorkflowScheduler};
use tally_flow::task::{AggregationTask, IntakeTask};

/// Supported task-queue transports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum TaskQueueKind {
    /// GCP Pub/Sub topics.
    GcpPubsub,
    /// AWS SNS topics.
    AwsSns,
}

#[derive(Debug, Parser)]
#[command(name = "tally-workflow-manager", version, about)]
struct Options {
    /// Kubernetes namespace in which downstream workers create jobs.
    #[arg(long = "k8s-namespace")]
    k8s_namespace: String,

    /// Whether this set of servers is "first", selecting which validity
    /// infix is treated as our own.
    #[arg(long = "is-first")]
    is_first: bool,

    /// Max age for intake batches to be worth processing.
    #[arg(long = "intake-max-age", default_value = "1h", value_parser = humantime::parse_duration)]
    intake_max_age: StdDuration,

    /// Bucket for input from the ingestor (s3:// or gs://).
    #[arg(long = "ingestor-input")]
    ingestor_input: String,

    /// Identity to use with the ingestor bucket.
    #[arg(long = "ingestor-identity")]
    ingestor_identity: Option<String>,

    /// Bucket for validation batches from this party (s3:// or gs://).
    #[arg(long = "own-validation-input")]
    own_validation_input: String,

    /// Identity to use with the own-validation bucket.
    #[arg(long = "own-validation-identity")]
    own_validation_identity: Option<String>,

    /// Bucket for validation batches from the peer (s3:// or gs://).
    #[arg(long = "peer-validation-input")]
    peer_validation_input: String,

    /// Identity to use with the peer-validation bucket.
    #[arg(long = "peer-validation-identity")]
    peer_validation_identity: Option<String>,

    /// How much time each aggregation covers.
    #[arg(long = "aggregation-period", default_value = "3h", value_parser = humantime::parse_duration)]
    aggregation_period: StdDuration,

    /// Wait this long after the end of an aggregation timeslice before
    /// running the aggregation.
    #[arg(long = "grace-period", default_value = "1h", value_parser = humantime::parse_duration)]
    grace_period: StdDuration,

    /// Prometheus push gateway; when unset, no metrics are pushed.
    #[arg(long = "push-gateway")]
    push_gateway: Option<String>,

    /// Path to the kubeconfig used to authenticate to the Kubernetes API.
    /// When unset, configuration is inferred from the environment.
    #[arg(long = "kube-config-path")]
    kube_config_path: Option<PathBuf>,

    /// If set, no operations with side effects will be done.
    #[arg(long = "dry-run")]
    dry_run: bool,

    /// Which task queue kind to use.
    #[arg(long = "task-queue-kind", value_enum)]
    task_queue_kind: TaskQueueKind,

    /// Topic to which intake tasks are published.
    #[arg(long = "intake-tasks-topic")]
    intake_tasks_topic: String,

    /// Topic to which aggregation tasks are published.
    #[arg(long = "aggregate-tasks-topic")]
    aggregate_tasks_topic: String,

    /// Whether to create the Pub/Sub topics used for intake and aggregation
    /// tasks before publishing.
    #[arg(long = "gcp-pubsub-create-topics")]
    gcp_pubsub_create_topics: bool,

    /// GCP project ID for the Pub/Sub task queue.
    #[arg(long = "gcp-project-id")]
    gcp_project_id: Option<String>,

    /// AWS region in which to publish to SNS topics.
    #[arg(long = "aws-sns-region")]
    aws_sns_region: Option<String>,

    /// AWS IAM role ARN to assume when publishing to SNS topics.
    #[arg(long = "aws-sns-identity")]
    aws_sns_identity: Option<String>,
}

/// Interval at which the exporter pushes to the gateway. Short, because the
/// whole process usually lives for seconds.
const PUSH_INTERVAL: StdDuration = StdDuration::from_secs(5);

type Enqueuers = (
    Arc<dyn Enqueuer<IntakeTask>>,
    Arc<dyn Enqueuer<AggregationTask>>,
);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let options = Options::parse();
    init_logging(LogFormat::Json);
    info!(
        version = env!("CARGO_PKG_VERSION"),
        args = ?std::env::args().skip(1).collect::<Vec<_>>(),
        "starting tally-workflow-manager"
    );

    if let Some(gateway) = &options.push_gateway {
        PrometheusBuilder::new()
            .with_push_gateway(gateway, PUSH_INTERVAL, None, None)
            .context("configuring prometheus push gateway")?
            .install()
            .context("installing prometheus exporter")?;
    }

    let config = ScheduleConfig {
        is_first: options.is_first,
        max_age: chrono_duration("--intake-max-age", options.intake_max_age)?,
        aggregation_period: chrono_duration("--aggregation-period", options.aggregation_period)?,
        grace_period: chrono_duration("--grace-period", options.grace_period)?,
    };

    let (intake_enqueuer, aggregation_enqueuer) = build_enqueuers(&options).await?;

    let intake_bucket = Bucket::from_url(
        &options.ingestor_input,
        options.ingestor_identity.as_deref(),
        options.dry_run,
    )
    .await
    .context("--ingestor-input")?;
    let own_validation_bucket = Bucket::from_url(
        &options.own_validation_input,
        options.own_validation_identity.as_deref(),
        options.dry_run,
    )
    .await
    .context("--own-validation-input")?;
    let peer_validation_bucket = Bucket::from_url(
        &options.peer_validation_input,
        options.peer_validation_identity.as_deref(),
        options.dry_run,
    )
    .await
    .context("--peer-validation-input")?;

    let job_lister = KubernetesJobLister::new(
        &options.k8s_namespace,
        options.kube_config_path.as_deref(),
    )
    .await
    .context("creating kubernetes client")?;

    // Existing jobs let us avoid scheduling redundant work and let the
    // finished ones be reaped later on.
    let existing_jobs = job_lister.list_jobs().await?;

    let inputs = ScheduleInputs {
        intake_files: intake_bucket.list_files().await?,
        own_validation_files: own_validation_bucket.list_files().await?,
        peer_validation_files: peer_validation_bucket.list_files().await?,
        existing_jobs,
    };

    let scheduler = WorkflowScheduler::new(Arc::new(SystemClock), config);
    let summary = scheduler
        .schedule_tasks(
            &inputs,
            &own_validation_bucket,
            intake_enqueuer.as_ref(),
            aggregation_enqueuer.as_ref(),
        )
        .await?;

    info!(summary = ?summary, "done");
    Ok(())
}

fn chrono_duration(flag: &str, duration: StdDuration) -> anyhow::Result<Duration> {
    Duration::from_std(duration).with_context(|| format!("{flag}: duration out of range"))
}

async fn build_enqueuers(options: &Options) -> anyhow::Result<Enqueuers> {
    match options.task_queue_kind {
        TaskQueueKind::GcpPubsub => pubsub_enqueuers(options).await,
        TaskQueueKind::AwsSns => sns_enqueuers(options).await,
    }
}

#[cfg(feature = "gcp")]
async fn pubsub_enqueuers(options: &Options) -> anyhow::Result<Enqueuers> {
    use tally_flow::dispatch::pubsub::PubSubEnqueuer;

    let project_id = options
        .gcp_project_id
        .as_deref()
        .context("--gcp-project-id is required for task-queue-kind=gcp-pubsub")?;

    if options.gcp_pubsub_create_topics {
        PubSubEnqueuer::create_topic_with_subscription(project_id, &options.intake_tasks_topic)
            .await
            .context("creating intake tasks topic")?;
        PubSubEnqueuer::create_topic_with_subscription(project_id, &options.aggregate_tasks_topic)
            .await
            .context("creating aggregate tasks topic")?;
    }

    let intake =
        PubSubEnqueuer::new(project_id, &options.intake_tasks_topic, options.dry_run).await?;
    let aggregation =
        PubSubEnqueuer::new(project_id, &options.aggregate_tasks_topic, options.dry_run).await?;
    Ok((Arc::new(intake), Arc::new(aggregation)))
}

#[cfg(not(feature = "gcp"))]
async fn pubsub_enqueuers(_options: &Options) -> anyhow::Result<Enqueuers> {
    anyhow::bail!("this binary was built without gcp-pubsub support (gcp feature)")
}

#[cfg(feature = "aws")]
async fn sns_enqueuers(options: &Options) -> anyhow::Result<Enqueuers> {
    use tally_flow::dispatch::sns::SnsEnqueuer;

    let region = options
        .aws_sns_region
        .as_deref()
        .context("--aws-sns-region is required for task-queue-kind=aws-sns")?;
    let identity = options.aws_sns_identity.as_deref();

    let intake = SnsEnqueuer::new(
        region,
        identity,
        &options.intake_tasks_topic,
        options.dry_run,
    )
    .await;
    let aggregation = SnsEnqueuer::new(
        region,
        identity,
        &options.aggregate_tasks_topic,
        options.dry_run,
    )
    .await;
    Ok((Arc::new(intake), Arc::new(aggregation)))
}

#[cfg(not(feature = "aws"))]
async fn sns_enqueuers(_options: &Options) -> anyhow::Result<Enqueuers> {
    anyhow::bail!("this binary was built without aws-sns support (aws feature)")
}
