use crate::config::OperatorConfig;
use crate::util::Error;
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Container, EnvVar, PodSpec, PodTemplateSpec, ResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::{Api, ObjectMeta, PostParams, Resource};
use kube::{Client, ResourceExt};
use std::collections::BTreeMap;
use supacontrol_common::labels;
use supacontrol_types::SupabaseInstance;

/// Image the provisioning and cleanup Jobs run. Alpine-based, ships both
/// helm and kubectl.
pub const JOB_IMAGE: &str = "alpine/k8s:1.29.2";

/// Jobs and their pods are reaped this long after completion.
const TTL_SECONDS_AFTER_FINISHED: i32 = 3600;

/// Namespace the tenant workload lives in, derived from the project name
/// and pinned into the status before any Job is created.
pub fn tenant_namespace(project: &str) -> String {
    format!("supa-{project}")
}

/// The two operations the controller delegates to short-lived Jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOperation {
    Provision,
    Cleanup,
}

impl JobOperation {
    /// Deterministic Job name. One Job per operation per instance; a second
    /// create under this name fails with AlreadyExists, which keeps the
    /// one-Job-per-attempt invariant cheap to enforce.
    pub fn job_name(&self, project: &str) -> String {
        match self {
            JobOperation::Provision => format!("supacontrol-provision-{project}"),
            JobOperation::Cleanup => format!("supacontrol-cleanup-{project}"),
        }
    }

    /// Value of the `operation` label.
    pub fn label(&self) -> &'static str {
        match self {
            JobOperation::Provision => "provision",
            JobOperation::Cleanup => "cleanup",
        }
    }

    fn backoff_limit(&self) -> i32 {
        match self {
            JobOperation::Provision => 3,
            JobOperation::Cleanup => 2,
        }
    }

    fn active_deadline_seconds(&self) -> i64 {
        match self {
            JobOperation::Provision => 900,
            JobOperation::Cleanup => 600,
        }
    }

    fn script(&self) -> &'static str {
        match self {
            JobOperation::Provision => PROVISION_SCRIPT,
            JobOperation::Cleanup => CLEANUP_SCRIPT,
        }
    }
}

fn job_labels(project: &str, operation: JobOperation) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    map.insert(labels::MANAGED_BY.to_owned(), labels::MANAGER.to_owned());
    map.insert(labels::INSTANCE.to_owned(), project.to_owned());
    map.insert(labels::OPERATION.to_owned(), operation.label().to_owned());
    map
}

/// Environment contract between the controller and the embedded scripts.
fn job_env(instance: &SupabaseInstance, config: &OperatorConfig) -> Vec<EnvVar> {
    let project = &instance.spec.project_name;
    // Read pinned identifiers back from the status so a Job created after a
    // crash-restart uses exactly the names recorded before the crash.
    let namespace = instance
        .status
        .as_ref()
        .and_then(|s| s.namespace.clone())
        .unwrap_or_else(|| tenant_namespace(project));
    let release_name = instance
        .status
        .as_ref()
        .and_then(|s| s.helm_release_name.clone())
        .unwrap_or_else(|| project.clone());
    let env = [
        ("INSTANCE_NAME", project.clone()),
        ("NAMESPACE", namespace),
        ("CHART_REPO", config.chart_repo.clone()),
        ("CHART_NAME", config.chart_name.clone()),
        (
            "CHART_VERSION",
            instance
                .spec
                .chart_version_or(&config.chart_version)
                .to_owned(),
        ),
        ("RELEASE_NAME", release_name),
    ];
    env.into_iter()
        .map(|(name, value)| EnvVar {
            name: name.to_owned(),
            value: Some(value),
            ..Default::default()
        })
        .collect()
}

fn job_resources() -> ResourceRequirements {
    let quantities = |cpu: &str, memory: &str| {
        let mut map = BTreeMap::new();
        map.insert("cpu".to_owned(), Quantity(cpu.to_owned()));
        map.insert("memory".to_owned(), Quantity(memory.to_owned()));
        map
    };
    ResourceRequirements {
        requests: Some(quantities("100m", "256Mi")),
        limits: Some(quantities("500m", "512Mi")),
        ..Default::default()
    }
}

/// Builds the declarative Job for one operation. The Job lives in the
/// operator's namespace, runs as the provisioning service account and is
/// owned by the instance so that instance deletion cascades to it.
pub fn build_job(
    instance: &SupabaseInstance,
    config: &OperatorConfig,
    operation: JobOperation,
) -> Job {
    let project = &instance.spec.project_name;
    Job {
        metadata: ObjectMeta {
            name: Some(operation.job_name(project)),
            namespace: Some(config.operator_namespace.clone()),
            labels: Some(job_labels(project, operation)),
            owner_references: Some(vec![instance.controller_owner_ref(&()).unwrap()]),
            ..Default::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(operation.backoff_limit()),
            active_deadline_seconds: Some(operation.active_deadline_seconds()),
            ttl_seconds_after_finished: Some(TTL_SECONDS_AFTER_FINISHED),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(job_labels(project, operation)),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    restart_policy: Some("Never".to_owned()),
                    service_account_name: Some(config.provisioner_service_account.clone()),
                    containers: vec![Container {
                        name: operation.label().to_owned(),
                        image: Some(JOB_IMAGE.to_owned()),
                        command: Some(vec![
                            "/bin/sh".to_owned(),
                            "-c".to_owned(),
                            operation.script().to_owned(),
                        ]),
                        env: Some(job_env(instance, config)),
                        resources: Some(job_resources()),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    }
}

/// Creates the Job unless a Job with its deterministic name already exists.
/// Returns the Job name and whether this call created it. Existing Jobs are
/// never mutated; the supported retry affordance is deleting the Job.
pub async fn create_if_absent(client: Client, job: Job) -> Result<(String, bool), Error> {
    let name = job.name_any();
    let namespace = job.namespace().unwrap();
    let api: Api<Job> = Api::namespaced(client, &namespace);
    match api.create(&PostParams::default(), &job).await {
        Ok(_) => Ok((name, true)),
        Err(kube::Error::Api(ae)) if ae.code == 409 => Ok((name, false)),
        Err(e) => Err(e.into()),
    }
}

/// Fetches a Job by name in the operator namespace, mapping 404 to `None`.
pub async fn get(client: Client, namespace: &str, name: &str) -> Result<Option<Job>, Error> {
    let api: Api<Job> = Api::namespaced(client, namespace);
    match api.get(name).await {
        Ok(job) => Ok(Some(job)),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// What a Job's status means for the phase machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    /// At least one pod completed successfully.
    Succeeded,
    /// The retry budget is exhausted or the Job carries a failure condition.
    Failed { message: String },
    /// Pods are currently running.
    Active,
    /// Created, but no pods have been scheduled yet.
    Pending,
}

/// Interprets a Job's observed status. A transient success followed by
/// retries can leave both the succeeded and failed counters non-zero;
/// success wins that tie.
pub fn observe(job: &Job) -> JobState {
    let status = job.status.as_ref();
    let succeeded = status.and_then(|s| s.succeeded).unwrap_or(0);
    let failed = status.and_then(|s| s.failed).unwrap_or(0);
    let active = status.and_then(|s| s.active).unwrap_or(0);
    // 6 is the apiserver default when the spec leaves the limit unset.
    let backoff_limit = job
        .spec
        .as_ref()
        .and_then(|s| s.backoff_limit)
        .unwrap_or(6);

    if succeeded >= 1 {
        return JobState::Succeeded;
    }
    if let Some(condition) = status
        .and_then(|s| s.conditions.as_ref())
        .and_then(|c| c.iter().find(|c| c.type_ == "Failed" && c.status == "True"))
    {
        let message = match (condition.reason.as_deref(), condition.message.as_deref()) {
            (Some(reason), Some(message)) => format!("{reason}: {message}"),
            (Some(reason), None) => reason.to_owned(),
            (None, Some(message)) => message.to_owned(),
            (None, None) => "BackoffLimitExceeded".to_owned(),
        };
        return JobState::Failed { message };
    }
    if failed >= backoff_limit {
        return JobState::Failed {
            message: "BackoffLimitExceeded".to_owned(),
        };
    }
    if active >= 1 {
        return JobState::Active;
    }
    JobState::Pending
}

/// Sealed script run by the provisioning Job. Generates the tenant
/// credentials, creates the secret and installs the chart. Each step echoes
/// a marker so `kubectl logs` shows progress.
const PROVISION_SCRIPT: &str = r#"set -eu
random_token() {
    head -c 64 /dev/urandom | base64 | tr -dc 'a-zA-Z0-9' | head -c "$1"
}
echo "[1/5] labeling tenant namespace ${NAMESPACE}"
kubectl label namespace "${NAMESPACE}" app.kubernetes.io/managed-by=supacontrol "instance=${INSTANCE_NAME}" --overwrite
echo "[2/5] generating credentials"
POSTGRES_PASSWORD=$(random_token 32)
JWT_SECRET=$(random_token 48)
ANON_KEY=$(random_token 40)
SERVICE_ROLE_KEY=$(random_token 40)
echo "[3/5] creating credentials secret"
kubectl -n "${NAMESPACE}" create secret generic supabase-credentials \
    --from-literal=postgres-password="${POSTGRES_PASSWORD}" \
    --from-literal=jwt-secret="${JWT_SECRET}" \
    --from-literal=anon-key="${ANON_KEY}" \
    --from-literal=service-role-key="${SERVICE_ROLE_KEY}" \
    --dry-run=client -o yaml | kubectl apply -f -
echo "[4/5] adding chart repository ${CHART_REPO}"
helm repo add supabase "${CHART_REPO}"
helm repo update supabase
echo "[5/5] installing release ${RELEASE_NAME} (chart ${CHART_NAME} ${CHART_VERSION})"
helm upgrade --install "${RELEASE_NAME}" "supabase/${CHART_NAME}" \
    --namespace "${NAMESPACE}" \
    --version "${CHART_VERSION}" \
    --set secret.db.password="${POSTGRES_PASSWORD}" \
    --set secret.jwt.secret="${JWT_SECRET}" \
    --set secret.jwt.anonKey="${ANON_KEY}" \
    --set secret.jwt.serviceKey="${SERVICE_ROLE_KEY}" \
    --wait
echo "provisioning complete for ${INSTANCE_NAME}"
"#;

/// Sealed script run by the cleanup Job. Uninstalls the release, then
/// deletes the tenant namespace without waiting for it to terminate.
const CLEANUP_SCRIPT: &str = r#"set -eu
echo "[1/2] uninstalling release ${RELEASE_NAME}"
helm uninstall "${RELEASE_NAME}" --namespace "${NAMESPACE}" --wait \
    || echo "release ${RELEASE_NAME} was not installed"
echo "[2/2] deleting tenant namespace ${NAMESPACE}"
kubectl delete namespace "${NAMESPACE}" --ignore-not-found --wait=false
echo "cleanup complete for ${INSTANCE_NAME}"
"#;
