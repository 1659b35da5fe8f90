use crate::config::OperatorConfig;
use crate::instances::jobs::{self, JobOperation};
use crate::instances::rbac;
use crate::util::{Error, finalizer, messages, patch::patch_status};
use chrono::Utc;
use kube::Client;
use kube::runtime::events::{EventType, Recorder};
use supacontrol_types::{
    ConditionStatus, InstanceCondition, InstancePhase, SupabaseInstance, SupabaseInstanceStatus,
    condition_reason, condition_type, set_condition,
};

use crate::util::events;

/// `https://<project>-studio.<domain>`, matching the ingress host the chart
/// publishes for the Studio UI.
pub(crate) fn studio_url(project: &str, domain: &str) -> String {
    format!("https://{project}-studio.{domain}")
}

/// `https://<project>-api.<domain>`, matching the API gateway ingress host.
pub(crate) fn api_url(project: &str, domain: &str) -> String {
    format!("https://{project}-api.{domain}")
}

fn condition(
    type_: &str,
    status: ConditionStatus,
    reason: &str,
    message: &str,
    observed_generation: Option<i64>,
) -> InstanceCondition {
    InstanceCondition {
        type_: type_.to_owned(),
        status,
        reason: Some(reason.to_owned()),
        message: Some(message.to_owned()),
        last_transition_time: Some(Utc::now().to_rfc3339()),
        observed_generation,
    }
}

/// Sets the phase, stamping the transition time only when the phase
/// actually changes.
fn enter_phase(status: &mut SupabaseInstanceStatus, phase: InstancePhase) {
    if status.phase != phase {
        status.last_transition_time = Some(Utc::now().to_rfc3339());
    }
    status.phase = phase;
}

/// Attaches the cleanup finalizer. This is the very first write on a fresh
/// instance; the status stays untouched until the finalizer has landed.
pub async fn add_finalizer(client: Client, instance: &SupabaseInstance) -> Result<(), Error> {
    finalizer::add(client, instance).await?;
    Ok(())
}

/// First status write: phase Pending with the observed generation pinned.
pub fn initialize_mutation(
    instance: &SupabaseInstance,
) -> impl Fn(&mut SupabaseInstanceStatus) + use<> {
    let generation = instance.metadata.generation;
    move |status| {
        set_condition(
            &mut status.conditions,
            condition(
                condition_type::READY,
                ConditionStatus::Unknown,
                condition_reason::RECONCILING,
                messages::RECONCILING,
                generation,
            ),
        );
        status.observed_generation = generation;
        enter_phase(status, InstancePhase::Pending);
        // Pending is the enum default, so entering it from an empty status
        // would not restamp; the first write still records when it happened.
        status
            .last_transition_time
            .get_or_insert_with(|| Utc::now().to_rfc3339());
    }
}

pub async fn initialize(
    client: Client,
    recorder: &Recorder,
    instance: &SupabaseInstance,
) -> Result<(), Error> {
    patch_status(client, instance, initialize_mutation(instance)).await?;
    events::publish(
        recorder,
        instance,
        EventType::Normal,
        "Pending",
        format!(
            "Accepted {}; reconciliation started",
            instance.spec.project_name
        ),
    )
    .await;
    Ok(())
}

/// Pins the derived identifiers in their own transaction so that a crash
/// before Job creation resumes with exactly the same names.
pub fn pin_identifiers_mutation(
    instance: &SupabaseInstance,
) -> impl Fn(&mut SupabaseInstanceStatus) + use<> {
    let project = instance.spec.project_name.clone();
    move |status| {
        status
            .namespace
            .get_or_insert_with(|| jobs::tenant_namespace(&project));
        status.helm_release_name.get_or_insert_with(|| project.clone());
        enter_phase(status, InstancePhase::Provisioning);
    }
}

pub async fn pin_identifiers(
    client: Client,
    recorder: &Recorder,
    instance: &SupabaseInstance,
) -> Result<(), Error> {
    patch_status(client, instance, pin_identifiers_mutation(instance)).await?;
    events::publish(
        recorder,
        instance,
        EventType::Normal,
        "Provisioning",
        format!(
            "Pinned tenant namespace {}",
            jobs::tenant_namespace(&instance.spec.project_name)
        ),
    )
    .await;
    Ok(())
}

/// Ensures the provisioning prerequisites and the provisioning Job exist.
/// Every step treats AlreadyExists as success, so the whole function can be
/// replayed after a crash at any point.
pub async fn ensure_provisioning(
    client: Client,
    recorder: &Recorder,
    config: &OperatorConfig,
    instance: &SupabaseInstance,
) -> Result<(), Error> {
    let namespace = rbac::ensure_namespace(client.clone(), instance).await?;
    rbac::ensure_rbac(client.clone(), &namespace, instance, config).await?;

    let job = jobs::build_job(instance, config, JobOperation::Provision);
    let (job_name, created) = jobs::create_if_absent(client.clone(), job).await?;

    let generation = instance.metadata.generation;
    let recorded_job_name = job_name.clone();
    patch_status(client, instance, move |status| {
        set_condition(
            &mut status.conditions,
            condition(
                condition_type::NAMESPACE_READY,
                ConditionStatus::True,
                condition_reason::NAMESPACE_CREATED,
                messages::NAMESPACE_READY,
                generation,
            ),
        );
        status.provisioning_job_name = Some(recorded_job_name.clone());
        status.error_message = None;
        enter_phase(status, InstancePhase::Provisioning);
    })
    .await?;

    if created {
        events::publish(
            recorder,
            instance,
            EventType::Normal,
            "Provisioning",
            format!("Created provisioning Job {job_name}"),
        )
        .await;
    }
    Ok(())
}

pub async fn mark_in_progress(
    client: Client,
    recorder: &Recorder,
    instance: &SupabaseInstance,
) -> Result<(), Error> {
    patch_status(client, instance, |status: &mut SupabaseInstanceStatus| {
        enter_phase(status, InstancePhase::ProvisioningInProgress);
    })
    .await?;
    events::publish(
        recorder,
        instance,
        EventType::Normal,
        "ProvisioningInProgress",
        "Provisioning Job has active pods".to_string(),
    )
    .await;
    Ok(())
}

/// Publishes the tenant URLs and advances to Running. Also used to refresh a
/// live instance after a spec edit; the JSON-patch diff drops every field
/// that did not actually change.
pub fn running_mutation(
    instance: &SupabaseInstance,
    config: &OperatorConfig,
) -> impl Fn(&mut SupabaseInstanceStatus) + use<> {
    let generation = instance.metadata.generation;
    let project = instance.spec.project_name.clone();
    let domain = instance
        .spec
        .ingress_domain_or(&config.ingress_domain)
        .to_owned();
    move |status| {
        // Conditions are written before the phase so a reader never sees
        // phase Running without Ready=True.
        for type_ in [
            condition_type::SECRETS_READY,
            condition_type::HELM_RELEASE_READY,
            condition_type::INGRESS_READY,
            condition_type::READY,
        ] {
            set_condition(
                &mut status.conditions,
                condition(
                    type_,
                    ConditionStatus::True,
                    condition_reason::PROVISIONING_COMPLETE,
                    messages::PROVISIONED,
                    generation,
                ),
            );
        }
        status.studio_url = Some(studio_url(&project, &domain));
        status.api_url = Some(api_url(&project, &domain));
        status.error_message = None;
        status.observed_generation = generation;
        enter_phase(status, InstancePhase::Running);
    }
}

pub async fn mark_running(
    client: Client,
    recorder: &Recorder,
    config: &OperatorConfig,
    instance: &SupabaseInstance,
) -> Result<(), Error> {
    patch_status(client, instance, running_mutation(instance, config)).await?;
    events::publish(
        recorder,
        instance,
        EventType::Normal,
        "Running",
        format!(
            "Provisioning of {} completed",
            instance.spec.project_name
        ),
    )
    .await;
    Ok(())
}

pub async fn refresh_running(
    client: Client,
    config: &OperatorConfig,
    instance: &SupabaseInstance,
) -> Result<(), Error> {
    patch_status(client, instance, running_mutation(instance, config)).await?;
    Ok(())
}

/// Records the provisioning failure. Terminal until an operator intervenes
/// (edits the spec or deletes the exhausted Job).
pub fn failed_mutation(
    instance: &SupabaseInstance,
    message: String,
) -> impl Fn(&mut SupabaseInstanceStatus) + use<> {
    let generation = instance.metadata.generation;
    move |status| {
        set_condition(
            &mut status.conditions,
            condition(
                condition_type::READY,
                ConditionStatus::False,
                condition_reason::PROVISIONING_FAILED,
                &message,
                generation,
            ),
        );
        status.error_message = Some(message.clone());
        enter_phase(status, InstancePhase::Failed);
    }
}

pub async fn mark_failed(
    client: Client,
    recorder: &Recorder,
    instance: &SupabaseInstance,
    message: String,
) -> Result<(), Error> {
    patch_status(client, instance, failed_mutation(instance, message.clone())).await?;
    events::publish(
        recorder,
        instance,
        EventType::Warning,
        condition_reason::PROVISIONING_FAILED,
        message,
    )
    .await;
    Ok(())
}

/// Enters the deletion path: records phase Deleting and makes sure the
/// cleanup Job exists.
pub async fn ensure_cleanup(
    client: Client,
    recorder: &Recorder,
    config: &OperatorConfig,
    instance: &SupabaseInstance,
) -> Result<(), Error> {
    let job = jobs::build_job(instance, config, JobOperation::Cleanup);
    let (job_name, created) = jobs::create_if_absent(client.clone(), job).await?;

    let recorded_job_name = job_name.clone();
    patch_status(client, instance, move |status| {
        status.cleanup_job_name = Some(recorded_job_name.clone());
        enter_phase(status, InstancePhase::Deleting);
    })
    .await?;

    if created {
        events::publish(
            recorder,
            instance,
            EventType::Normal,
            "Deleting",
            format!("Created cleanup Job {job_name}"),
        )
        .await;
    }
    Ok(())
}

pub async fn mark_deleting_in_progress(
    client: Client,
    recorder: &Recorder,
    instance: &SupabaseInstance,
) -> Result<(), Error> {
    patch_status(client, instance, |status: &mut SupabaseInstanceStatus| {
        enter_phase(status, InstancePhase::DeletingInProgress);
    })
    .await?;
    events::publish(
        recorder,
        instance,
        EventType::Normal,
        "DeletingInProgress",
        "Cleanup Job has active pods".to_string(),
    )
    .await;
    Ok(())
}

/// Surfaces a cleanup failure. The finalizer stays on: tenant teardown must
/// be observed complete before the resource may be collected.
pub async fn mark_cleanup_failed(
    client: Client,
    recorder: &Recorder,
    instance: &SupabaseInstance,
    message: String,
) -> Result<(), Error> {
    let error_message = format!("{}: {message}", messages::CLEANUP_STUCK);
    let recorded = error_message.clone();
    patch_status(client, instance, move |status: &mut SupabaseInstanceStatus| {
        status.error_message = Some(recorded.clone());
        enter_phase(status, InstancePhase::Deleting);
    })
    .await?;
    events::publish(
        recorder,
        instance,
        EventType::Warning,
        "CleanupFailed",
        error_message,
    )
    .await;
    Ok(())
}

/// Detaches the finalizer after cleanup was observed complete. Garbage
/// collection removes the resource; the next reconcile sees not-found.
pub async fn complete_deletion(
    client: Client,
    recorder: &Recorder,
    instance: &SupabaseInstance,
) -> Result<(), Error> {
    events::publish(
        recorder,
        instance,
        EventType::Normal,
        "Cleaned",
        format!("Tenant resources of {} removed", instance.spec.project_name),
    )
    .await;
    finalizer::remove(client, instance).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::Resource;
    use supacontrol_types::SupabaseInstanceSpec;

    fn config() -> OperatorConfig {
        OperatorConfig {
            chart_repo: "https://charts.example.org".to_owned(),
            chart_name: "supabase".to_owned(),
            chart_version: "0.1.3".to_owned(),
            ingress_class: "nginx".to_owned(),
            ingress_domain: "example.com".to_owned(),
            cert_issuer: "letsencrypt-prod".to_owned(),
            operator_namespace: "supacontrol-system".to_owned(),
            provisioner_service_account: "supacontrol-provisioner".to_owned(),
        }
    }

    fn instance(project: &str) -> SupabaseInstance {
        let mut instance = SupabaseInstance::new(
            project,
            SupabaseInstanceSpec {
                project_name: project.to_owned(),
                ..Default::default()
            },
        );
        instance.meta_mut().generation = Some(3);
        instance
    }

    fn ready_status<'a>(status: &'a SupabaseInstanceStatus) -> Option<&'a InstanceCondition> {
        status
            .conditions
            .iter()
            .find(|c| c.type_ == condition_type::READY)
    }

    #[test]
    fn urls_follow_the_published_naming_scheme() {
        assert_eq!(
            studio_url("demo", "supacontrol.local"),
            "https://demo-studio.supacontrol.local"
        );
        assert_eq!(
            api_url("demo", "supacontrol.local"),
            "https://demo-api.supacontrol.local"
        );
    }

    #[test]
    fn initialize_pins_generation_and_enters_pending() {
        let mut status = SupabaseInstanceStatus::default();
        initialize_mutation(&instance("demo"))(&mut status);
        assert_eq!(status.phase, InstancePhase::Pending);
        assert_eq!(status.observed_generation, Some(3));
        assert!(status.last_transition_time.is_some());
        assert_eq!(ready_status(&status).unwrap().status, ConditionStatus::Unknown);
    }

    #[test]
    fn pinned_identifiers_are_immutable() {
        let mut status = SupabaseInstanceStatus::default();
        let mutation = pin_identifiers_mutation(&instance("demo"));
        mutation(&mut status);
        assert_eq!(status.namespace.as_deref(), Some("supa-demo"));
        assert_eq!(status.helm_release_name.as_deref(), Some("demo"));
        assert_eq!(status.phase, InstancePhase::Provisioning);
        assert!(status.last_transition_time.is_some());

        // A replay (or a renamed project) never overwrites pinned names.
        status.namespace = Some("supa-original".to_owned());
        status.helm_release_name = Some("original".to_owned());
        mutation(&mut status);
        assert_eq!(status.namespace.as_deref(), Some("supa-original"));
        assert_eq!(status.helm_release_name.as_deref(), Some("original"));
    }

    #[test]
    fn running_publishes_urls_and_clears_errors() {
        let mut status = SupabaseInstanceStatus {
            phase: InstancePhase::ProvisioningInProgress,
            error_message: Some("left over".to_owned()),
            ..Default::default()
        };
        running_mutation(&instance("demo"), &config())(&mut status);
        assert_eq!(status.phase, InstancePhase::Running);
        assert_eq!(
            status.studio_url.as_deref(),
            Some("https://demo-studio.example.com")
        );
        assert_eq!(
            status.api_url.as_deref(),
            Some("https://demo-api.example.com")
        );
        assert_eq!(status.error_message, None);
        assert_eq!(status.observed_generation, Some(3));
        let ready = ready_status(&status).unwrap();
        assert_eq!(ready.status, ConditionStatus::True);
        assert_eq!(
            ready.reason.as_deref(),
            Some(condition_reason::PROVISIONING_COMPLETE)
        );
        for type_ in [
            condition_type::SECRETS_READY,
            condition_type::HELM_RELEASE_READY,
            condition_type::INGRESS_READY,
        ] {
            assert!(status.conditions.iter().any(|c| c.type_ == type_));
        }
    }

    #[test]
    fn running_respects_the_spec_domain_override() {
        let mut overridden = instance("demo");
        overridden.spec.ingress_domain = Some("tenants.example.org".to_owned());
        let mut status = SupabaseInstanceStatus::default();
        running_mutation(&overridden, &config())(&mut status);
        assert_eq!(
            status.studio_url.as_deref(),
            Some("https://demo-studio.tenants.example.org")
        );
    }

    #[test]
    fn failed_records_diagnostic_and_flips_ready() {
        let mut status = SupabaseInstanceStatus {
            phase: InstancePhase::ProvisioningInProgress,
            ..Default::default()
        };
        failed_mutation(&instance("bad"), "BackoffLimitExceeded".to_owned())(&mut status);
        assert_eq!(status.phase, InstancePhase::Failed);
        assert_eq!(status.error_message.as_deref(), Some("BackoffLimitExceeded"));
        assert!(status.last_transition_time.is_some());
        let ready = ready_status(&status).unwrap();
        assert_eq!(ready.status, ConditionStatus::False);
        assert_eq!(
            ready.reason.as_deref(),
            Some(condition_reason::PROVISIONING_FAILED)
        );
    }

    #[test]
    fn replaying_a_mutation_converges() {
        let instance = instance("demo");
        let config = config();
        let mut once = SupabaseInstanceStatus::default();
        let mutation = running_mutation(&instance, &config);
        mutation(&mut once);
        let mut twice = once.clone();
        mutation(&mut twice);
        // The transition stamp does not move on replay, so the whole status
        // is byte-for-byte stable.
        assert_eq!(once.last_transition_time, twice.last_transition_time);
        assert_eq!(once.studio_url, twice.studio_url);
        assert_eq!(once.phase, twice.phase);
    }
}
