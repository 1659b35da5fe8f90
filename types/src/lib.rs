use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// Desired state of a managed Supabase tenant. The `SupabaseInstance`
/// resource is cluster-scoped; every subordinate object (tenant namespace,
/// provisioning/cleanup Jobs, per-tenant RBAC) derives its name from
/// `projectName`.
#[derive(CustomResource, Serialize, Deserialize, Default, Debug, PartialEq, Clone, JsonSchema)]
#[kube(
    group = "supacontrol.io",
    version = "v1",
    kind = "SupabaseInstance",
    plural = "supabaseinstances",
    derive = "PartialEq",
    status = "SupabaseInstanceStatus"
)]
#[kube(derive = "Default")]
#[kube(
    printcolumn = "{\"jsonPath\": \".status.phase\", \"name\": \"PHASE\", \"type\": \"string\" }"
)]
#[kube(
    printcolumn = "{\"jsonPath\": \".status.lastUpdated\", \"name\": \"AGE\", \"type\": \"date\" }"
)]
pub struct SupabaseInstanceSpec {
    /// Stable DNS-label identifier. All subordinate names are derived from
    /// this and it must not change after creation.
    #[serde(rename = "projectName")]
    pub project_name: String,

    /// Overrides the operator's default Supabase chart version.
    #[serde(rename = "chartVersion")]
    pub chart_version: Option<String>,

    /// Overrides the operator's default ingress class.
    #[serde(rename = "ingressClass")]
    pub ingress_class: Option<String>,

    /// Overrides the operator's default ingress domain.
    #[serde(rename = "ingressDomain")]
    pub ingress_domain: Option<String>,

    /// Suppresses reconciliation while true. Deletion still proceeds.
    #[serde(default)]
    pub paused: bool,
}

impl SupabaseInstanceSpec {
    /// The ingress domain to publish under, falling back to the operator
    /// default when the spec does not override it.
    pub fn ingress_domain_or<'a>(&'a self, default: &'a str) -> &'a str {
        self.ingress_domain.as_deref().unwrap_or(default)
    }

    /// The chart version to install, falling back to the operator default.
    pub fn chart_version_or<'a>(&'a self, default: &'a str) -> &'a str {
        self.chart_version.as_deref().unwrap_or(default)
    }
}

/// Status object for the [`SupabaseInstance`] resource.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Default, JsonSchema)]
pub struct SupabaseInstanceStatus {
    /// A short description of the instance's current lifecycle state.
    pub phase: InstancePhase,

    /// Tenant namespace, pinned on the first transition out of Pending and
    /// immutable afterwards.
    pub namespace: Option<String>,

    /// Helm release name, pinned together with `namespace`.
    #[serde(rename = "helmReleaseName")]
    pub helm_release_name: Option<String>,

    /// Name of the provisioning Job, recorded when it is created.
    #[serde(rename = "provisioningJobName")]
    pub provisioning_job_name: Option<String>,

    /// Name of the cleanup Job, recorded when it is created.
    #[serde(rename = "cleanupJobName")]
    pub cleanup_job_name: Option<String>,

    /// Published Studio URL; non-empty whenever the phase is Running.
    #[serde(rename = "studioURL")]
    pub studio_url: Option<String>,

    /// Published API URL; non-empty whenever the phase is Running.
    #[serde(rename = "apiURL")]
    pub api_url: Option<String>,

    /// Human-readable diagnostic for the most recent failure. Cleared on
    /// success.
    #[serde(rename = "errorMessage")]
    pub error_message: Option<String>,

    /// Wall-clock timestamp of the most recent phase change.
    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: Option<String>,

    /// The spec generation this status reflects. Never exceeds
    /// `metadata.generation`.
    #[serde(rename = "observedGeneration")]
    pub observed_generation: Option<i64>,

    /// Fine-grained readiness milestones, see [`condition_type`].
    #[serde(default)]
    pub conditions: Vec<InstanceCondition>,

    /// Timestamp of when the status object was last updated.
    #[serde(rename = "lastUpdated")]
    pub last_updated: Option<String>,
}

/// A short description of the [`SupabaseInstance`] resource's current state.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, JsonSchema, Default)]
pub enum InstancePhase {
    /// The instance first appeared to the controller.
    #[default]
    Pending,

    /// Derived identifiers are pinned and prerequisites are being created.
    Provisioning,

    /// The provisioning Job has active pods.
    ProvisioningInProgress,

    /// The tenant workload is live and URLs are published.
    Running,

    /// The provisioning Job exhausted its retry budget.
    Failed,

    /// Deletion has begun; the cleanup Job is being created or retried.
    Deleting,

    /// The cleanup Job has active pods.
    DeletingInProgress,

    /// Catch-all for phase strings this controller does not recognize
    /// (written by a newer or older controller, or hand-edited). Never
    /// written back; reconciliation resets it to Pending.
    #[serde(other)]
    Unknown,
}

impl FromStr for InstancePhase {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Pending" => Ok(InstancePhase::Pending),
            "Provisioning" => Ok(InstancePhase::Provisioning),
            "ProvisioningInProgress" => Ok(InstancePhase::ProvisioningInProgress),
            "Running" => Ok(InstancePhase::Running),
            "Failed" => Ok(InstancePhase::Failed),
            "Deleting" => Ok(InstancePhase::Deleting),
            "DeletingInProgress" => Ok(InstancePhase::DeletingInProgress),
            "Unknown" => Ok(InstancePhase::Unknown),
            _ => Err(()),
        }
    }
}

impl fmt::Display for InstancePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstancePhase::Pending => write!(f, "Pending"),
            InstancePhase::Provisioning => write!(f, "Provisioning"),
            InstancePhase::ProvisioningInProgress => write!(f, "ProvisioningInProgress"),
            InstancePhase::Running => write!(f, "Running"),
            InstancePhase::Failed => write!(f, "Failed"),
            InstancePhase::Deleting => write!(f, "Deleting"),
            InstancePhase::DeletingInProgress => write!(f, "DeletingInProgress"),
            InstancePhase::Unknown => write!(f, "Unknown"),
        }
    }
}

/// A named readiness milestone on the [`SupabaseInstanceStatus`].
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct InstanceCondition {
    #[serde(rename = "type")]
    pub type_: String,

    pub status: ConditionStatus,

    pub reason: Option<String>,

    pub message: Option<String>,

    /// Timestamp of the most recent status flip for this condition type.
    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: Option<String>,

    /// The spec generation observed when this condition was written.
    #[serde(rename = "observedGeneration")]
    pub observed_generation: Option<i64>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

impl fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConditionStatus::True => write!(f, "True"),
            ConditionStatus::False => write!(f, "False"),
            ConditionStatus::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Condition types reported on the status object.
pub mod condition_type {
    /// Overall readiness of the instance.
    pub const READY: &str = "Ready";
    /// The tenant namespace exists.
    pub const NAMESPACE_READY: &str = "NamespaceReady";
    /// The tenant credentials secret exists.
    pub const SECRETS_READY: &str = "SecretsReady";
    /// The Helm release is installed.
    pub const HELM_RELEASE_READY: &str = "HelmReleaseReady";
    /// The ingress endpoints are published.
    pub const INGRESS_READY: &str = "IngressReady";
}

/// Machine-readable reason tags used on conditions.
pub mod condition_reason {
    pub const RECONCILING: &str = "Reconciling";
    pub const NAMESPACE_CREATED: &str = "NamespaceCreated";
    pub const PROVISIONING_COMPLETE: &str = "ProvisioningComplete";
    pub const PROVISIONING_FAILED: &str = "ProvisioningFailed";
}

/// Upserts `next` into the condition set, keyed by condition type. The
/// recorded transition time only moves when the status value actually flips.
pub fn set_condition(conditions: &mut Vec<InstanceCondition>, next: InstanceCondition) {
    match conditions.iter_mut().find(|c| c.type_ == next.type_) {
        Some(existing) => {
            if existing.status == next.status {
                let last_transition_time = existing.last_transition_time.take();
                *existing = InstanceCondition {
                    last_transition_time,
                    ..next
                };
            } else {
                *existing = next;
            }
        }
        None => conditions.push(next),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ready(status: ConditionStatus, reason: &str, stamp: &str) -> InstanceCondition {
        InstanceCondition {
            type_: condition_type::READY.to_string(),
            status,
            reason: Some(reason.to_string()),
            message: None,
            last_transition_time: Some(stamp.to_string()),
            observed_generation: Some(1),
        }
    }

    #[test]
    fn inserts_missing_condition() {
        let mut conditions = Vec::new();
        set_condition(
            &mut conditions,
            ready(ConditionStatus::Unknown, condition_reason::RECONCILING, "t0"),
        );
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].status, ConditionStatus::Unknown);
    }

    #[test]
    fn status_flip_replaces_transition_time() {
        let mut conditions = vec![ready(
            ConditionStatus::Unknown,
            condition_reason::RECONCILING,
            "t0",
        )];
        set_condition(
            &mut conditions,
            ready(
                ConditionStatus::True,
                condition_reason::PROVISIONING_COMPLETE,
                "t1",
            ),
        );
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].status, ConditionStatus::True);
        assert_eq!(conditions[0].last_transition_time.as_deref(), Some("t1"));
    }

    #[test]
    fn unchanged_status_keeps_transition_time() {
        let mut conditions = vec![ready(
            ConditionStatus::True,
            condition_reason::PROVISIONING_COMPLETE,
            "t0",
        )];
        set_condition(
            &mut conditions,
            ready(
                ConditionStatus::True,
                condition_reason::PROVISIONING_COMPLETE,
                "t1",
            ),
        );
        assert_eq!(conditions[0].last_transition_time.as_deref(), Some("t0"));
    }

    #[test]
    fn distinct_types_coexist() {
        let mut conditions = vec![ready(
            ConditionStatus::True,
            condition_reason::PROVISIONING_COMPLETE,
            "t0",
        )];
        set_condition(
            &mut conditions,
            InstanceCondition {
                type_: condition_type::NAMESPACE_READY.to_string(),
                status: ConditionStatus::True,
                reason: Some(condition_reason::NAMESPACE_CREATED.to_string()),
                message: None,
                last_transition_time: Some("t1".to_string()),
                observed_generation: Some(1),
            },
        );
        assert_eq!(conditions.len(), 2);
    }

    #[test]
    fn spec_defaults_fall_back_to_operator_config() {
        let spec = SupabaseInstanceSpec {
            project_name: "demo".to_string(),
            ..Default::default()
        };
        assert_eq!(spec.ingress_domain_or("example.com"), "example.com");
        assert_eq!(spec.chart_version_or("0.1.3"), "0.1.3");

        let pinned = SupabaseInstanceSpec {
            project_name: "demo".to_string(),
            ingress_domain: Some("tenants.example.org".to_string()),
            chart_version: Some("0.2.0".to_string()),
            ..Default::default()
        };
        assert_eq!(
            pinned.ingress_domain_or("example.com"),
            "tenants.example.org"
        );
        assert_eq!(pinned.chart_version_or("0.1.3"), "0.2.0");
    }

    #[test]
    fn phase_survives_kubectl_round_trip() {
        for phase in [
            InstancePhase::Pending,
            InstancePhase::Provisioning,
            InstancePhase::ProvisioningInProgress,
            InstancePhase::Running,
            InstancePhase::Failed,
            InstancePhase::Deleting,
            InstancePhase::DeletingInProgress,
            InstancePhase::Unknown,
        ] {
            assert_eq!(phase.to_string().parse::<InstancePhase>(), Ok(phase));
        }
        assert!("NotAPhase".parse::<InstancePhase>().is_err());
    }

    #[test]
    fn unrecognized_phase_strings_deserialize_to_unknown() {
        // A stray status write from a different controller version must not
        // make the whole object undeserializable; it lands on the catch-all
        // and the reconciler resets it.
        let phase: InstancePhase =
            serde_json::from_value(serde_json::json!("Archived")).unwrap();
        assert_eq!(phase, InstancePhase::Unknown);
        assert_eq!(
            serde_json::to_value(InstancePhase::Unknown).unwrap(),
            serde_json::json!("Unknown")
        );
    }
}
