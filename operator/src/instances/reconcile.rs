use futures::stream::StreamExt;
use k8s_openapi::api::batch::v1::Job;
use kube::{
    Api, ResourceExt,
    client::Client,
    runtime::events::Recorder,
    runtime::{Controller, controller::Action},
};
use kube_leader_election::{LeaseLock, LeaseLockParams};
use owo_colors::OwoColorize;
use std::sync::Arc;
use supacontrol_types::*;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

use super::{actions, jobs, planner};
use crate::config::OperatorConfig;
use crate::instances::jobs::JobOperation;
use crate::instances::planner::InstanceAction;
use crate::util::{
    self, Error, FAILED_PROBE_INTERVAL,
    colors::{FG1, FG2},
};

#[cfg(feature = "metrics")]
use crate::util::metrics::ControllerMetrics;

/// Entrypoint for the `SupabaseInstance` controller.
pub async fn run(client: Client, config: OperatorConfig) -> Result<(), Error> {
    println!("{}", "Starting SupabaseInstance controller...".green());

    // Preparation of resources used by the `kube_runtime::Controller`
    let context: Arc<ContextData> = Arc::new(ContextData::new(client.clone(), config.clone()));

    // Leader election and the Jobs both live in the operator's namespace,
    // which keeps the controller's own RBAC namespaced rather than
    // cluster-scoped wherever possible.
    let lease_namespace = config.operator_namespace.clone();
    // Unique identity per replica (Downward API POD_NAME is ideal).
    // Fallback to hostname if not present.
    let holder_id = std::env::var("POD_NAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| format!("supacontrol-controller-{}", uuid::Uuid::new_v4()));
    // The shared lock name across all replicas
    let lease_name = "supacontrol-controller-lock".to_string();
    // TTL: how long leadership is considered valid without renewal.
    // Renew should happen well before TTL expires.
    let lease_ttl = Duration::from_secs(15);
    let renew_every = Duration::from_secs(5);
    let leadership = LeaseLock::new(
        client.clone(),
        &lease_namespace,
        LeaseLockParams {
            holder_id,
            lease_name,
            lease_ttl,
        },
    );

    let shutdown = CancellationToken::new();
    supacontrol_common::shutdown::trigger_on_signal(shutdown.clone());
    supacontrol_common::signal_ready();
    println!("{}", "🌱 Starting SupabaseInstance controller...".green());
    // We run indefinitely; only the leader runs the controller.
    // On leadership loss, we abort the controller and go back to standby.
    let mut controller_task: Option<tokio::task::JoinHandle<()>> = None;
    let mut tick = tokio::time::interval(renew_every);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                if let Some(task) = controller_task.take() {
                    task.abort();
                    task.await.ok();
                }
                break Ok(())
            },
            _ = tick.tick() => {}
        }
        let lease = match leadership.try_acquire_or_renew().await {
            Ok(l) => l,
            Err(e) => {
                // If we can't talk to the apiserver / update Lease, assume we are not safe to lead.
                eprintln!("leader election renew/acquire failed: {e}");
                if let Some(task) = controller_task.take() {
                    task.abort();
                    eprintln!("aborted controller due to leader election error");
                }
                continue;
            }
        };
        if lease.acquired_lease {
            // We are leader; ensure controller is running
            if controller_task.is_none() {
                println!("acquired leadership; starting controller");
                let client_for_controller = client.clone();
                let context_for_controller = context.clone();
                let jobs_namespace = lease_namespace.clone();
                let crd_api_for_controller: Api<SupabaseInstance> =
                    Api::all(client_for_controller.clone());
                controller_task = Some(tokio::spawn(async move {
                    println!("{}", "🚀 SupabaseInstance controller started.".green());
                    Controller::new(crd_api_for_controller, Default::default())
                        .owns(
                            Api::<Job>::namespaced(client_for_controller, &jobs_namespace),
                            Default::default(),
                        )
                        .run(reconcile, on_error, context_for_controller)
                        .for_each(|_res| async move {})
                        .await;
                }));
            }
        } else if let Some(task) = controller_task.take() {
            // We are NOT leader; ensure controller is stopped
            eprintln!("lost leadership; stopping controller");
            task.abort();
        }
    }
}

/// Context injected with each `reconcile` and `on_error` method invocation.
struct ContextData {
    /// Kubernetes client to make Kubernetes API requests with. Required for K8S resource management.
    client: Client,

    /// Cluster-level defaults, read once at startup.
    config: OperatorConfig,

    /// Event recorder surfacing transitions in `kubectl describe`.
    recorder: Recorder,

    #[cfg(feature = "metrics")]
    metrics: ControllerMetrics,
}

impl ContextData {
    /// Constructs a new instance of ContextData.
    ///
    /// # Arguments:
    /// - `client`: A Kubernetes client to make Kubernetes REST API requests with. Resources
    ///   will be created and deleted with this client.
    /// - `config`: Operator-level configuration from the environment.
    pub fn new(client: Client, config: OperatorConfig) -> Self {
        let recorder = util::events::recorder(client.clone());
        #[cfg(feature = "metrics")]
        {
            ContextData {
                client,
                config,
                recorder,
                metrics: ControllerMetrics::new("instances"),
            }
        }
        #[cfg(not(feature = "metrics"))]
        {
            ContextData {
                client,
                config,
                recorder,
            }
        }
    }
}

/// Reconciliation function for the `SupabaseInstance` resource.
async fn reconcile(
    instance: Arc<SupabaseInstance>,
    context: Arc<ContextData>,
) -> Result<Action, Error> {
    // The `Client` is shared -> a clone from the reference is obtained
    let client: Client = context.client.clone();

    // The resource is cluster-scoped; its name doubles as the worker key, so
    // at most one reconcile per instance runs at a time.
    let name = instance.name_any();

    // Increment total number of reconciles for the SupabaseInstance resource.
    #[cfg(feature = "metrics")]
    context
        .metrics
        .reconcile_counter
        .with_label_values(&[&name])
        .inc();

    // Benchmark the read phase of reconciliation.
    #[cfg(feature = "metrics")]
    let start = std::time::Instant::now();

    // Read phase of reconciliation determines goal during the write phase.
    let action = determine_action(client.clone(), &context.config, &instance).await?;

    if action != InstanceAction::NoOp {
        println!(
            "🔧 {}{}{}",
            name.color(FG2),
            " ACTION: ".color(FG1),
            format!("{:?}", action).color(FG2),
        );
    }

    // Report the read phase performance.
    #[cfg(feature = "metrics")]
    context
        .metrics
        .read_histogram
        .with_label_values(&[&name, action.to_str()])
        .observe(start.elapsed().as_secs_f64());

    // Increment the counter for the action.
    #[cfg(feature = "metrics")]
    context
        .metrics
        .action_counter
        .with_label_values(&[&name, action.to_str()])
        .inc();

    // Benchmark the write phase of reconciliation.
    #[cfg(feature = "metrics")]
    let timer = match action {
        // Don't measure performance for NoOp actions.
        InstanceAction::NoOp => None,
        // Start a performance timer for the write phase.
        _ => Some(
            context
                .metrics
                .write_histogram
                .with_label_values(&[&name, action.to_str()])
                .start_timer(),
        ),
    };

    // Performs action as decided by the `plan` function.
    // This is the write phase of reconciliation.
    let result = match perform_action(client.clone(), &context, &instance, action).await {
        Ok(result) => result,
        Err(Error::Kube {
            source: kube::Error::Api(ae),
        }) if ae.code == 403 => {
            // The controller itself lacks RBAC for this step. Retrying cannot
            // succeed until an operator fixes the controller's permissions,
            // so surface the diagnostic on the resource instead of spinning.
            actions::mark_failed(
                client,
                &context.recorder,
                &instance,
                format!("forbidden: {}", ae.message),
            )
            .await?;
            Action::requeue(FAILED_PROBE_INTERVAL)
        }
        Err(e) => return Err(e),
    };

    #[cfg(feature = "metrics")]
    if let Some(timer) = timer {
        timer.observe_duration();
    }

    Ok(result)
}

/// Write phase: performs one action decided by the planner and returns the
/// follow-up scheduling.
async fn perform_action(
    client: Client,
    context: &Arc<ContextData>,
    instance: &SupabaseInstance,
    action: InstanceAction,
) -> Result<Action, Error> {
    let requeue = planner::requeue_hint(&action);
    let result = match action {
        InstanceAction::Requeue(duration) => Action::requeue(duration),
        InstanceAction::AddFinalizer => {
            // The finalizer lands before the first status write so that even
            // a create/delete race cannot leak tenant resources.
            actions::add_finalizer(client, instance).await?;
            Action::requeue(requeue)
        }
        InstanceAction::Initialize => {
            actions::initialize(client, &context.recorder, instance).await?;
            Action::requeue(requeue)
        }
        InstanceAction::PinIdentifiers => {
            actions::pin_identifiers(client, &context.recorder, instance).await?;
            Action::requeue(requeue)
        }
        InstanceAction::EnsureProvisioning => {
            actions::ensure_provisioning(client, &context.recorder, &context.config, instance)
                .await?;
            Action::requeue(requeue)
        }
        InstanceAction::MarkProvisioningInProgress => {
            actions::mark_in_progress(client, &context.recorder, instance).await?;
            Action::requeue(requeue)
        }
        InstanceAction::MarkRunning => {
            actions::mark_running(client, &context.recorder, &context.config, instance).await?;
            Action::requeue(requeue)
        }
        InstanceAction::RefreshRunning => {
            actions::refresh_running(client, &context.config, instance).await?;
            Action::requeue(requeue)
        }
        InstanceAction::MarkFailed { message } => {
            actions::mark_failed(client, &context.recorder, instance, message).await?;
            Action::requeue(requeue)
        }
        InstanceAction::EnsureCleanup => {
            actions::ensure_cleanup(client, &context.recorder, &context.config, instance).await?;
            Action::requeue(requeue)
        }
        InstanceAction::MarkDeletingInProgress => {
            actions::mark_deleting_in_progress(client, &context.recorder, instance).await?;
            Action::requeue(requeue)
        }
        InstanceAction::MarkCleanupFailed { message } => {
            actions::mark_cleanup_failed(client, &context.recorder, instance, message).await?;
            Action::requeue(requeue)
        }
        InstanceAction::RemoveFinalizer => {
            // Cleanup was observed complete; once the finalizer is off the
            // apiserver collects the resource and the next pass sees
            // not-found.
            actions::complete_deletion(client, &context.recorder, instance).await?;
            Action::await_change()
        }
        // The resource is in its desired state (or paused); only a watch
        // event should wake it again.
        InstanceAction::NoOp => Action::await_change(),
    };
    Ok(result)
}

/// Read phase: fetches the two Jobs under their deterministic names and asks
/// the planner for the next step. All decision logic lives in
/// [`planner::plan`]; this function only gathers its inputs.
async fn determine_action(
    client: Client,
    config: &OperatorConfig,
    instance: &SupabaseInstance,
) -> Result<InstanceAction, Error> {
    // A paused instance that is not being deleted gets no reads and no
    // writes at all.
    if instance.spec.paused && instance.metadata.deletion_timestamp.is_none() {
        return Ok(InstanceAction::NoOp);
    }
    let project = &instance.spec.project_name;
    let provision_job = jobs::get(
        client.clone(),
        &config.operator_namespace,
        &JobOperation::Provision.job_name(project),
    )
    .await?;
    let cleanup_job = jobs::get(
        client,
        &config.operator_namespace,
        &JobOperation::Cleanup.job_name(project),
    )
    .await?;
    Ok(planner::plan(
        instance,
        provision_job.as_ref(),
        cleanup_job.as_ref(),
    ))
}

/// Actions to be taken when a reconciliation fails - for whatever reason.
/// Prints out the error to `stderr` and requeues the resource for another reconciliation after
/// five seconds.
///
/// # Arguments
/// - `instance`: The erroneous resource.
/// - `error`: A reference to the `kube::Error` that occurred during reconciliation.
/// - `_context`: Unused argument. Context Data "injected" automatically by kube-rs.
fn on_error(instance: Arc<SupabaseInstance>, error: &Error, _context: Arc<ContextData>) -> Action {
    eprintln!(
        "{}",
        format!("Reconciliation error: {:?} {:?}", error, instance).red()
    );
    Action::requeue(Duration::from_secs(5))
}
