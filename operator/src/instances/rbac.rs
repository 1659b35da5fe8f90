use crate::config::OperatorConfig;
use crate::instances::jobs::tenant_namespace;
use crate::util::Error;
use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::api::rbac::v1::{PolicyRule, Role, RoleBinding, RoleRef, Subject};
use kube::api::{Api, ObjectMeta, PostParams};
use kube::{Client, Resource, ResourceExt};
use std::collections::BTreeMap;
use supacontrol_common::labels;
use supacontrol_types::SupabaseInstance;

/// Name of the per-tenant Role and RoleBinding.
pub const ROLE_NAME: &str = "supacontrol-provisioner";

/// Verbs granting full management of a resource inside the tenant
/// namespace. Deliberately no cluster-scoped verbs anywhere: a compromised
/// Job is contained to its own tenant.
const MANAGE: [&str; 7] = [
    "create", "delete", "get", "list", "patch", "update", "watch",
];

fn managed_labels(project: &str) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    map.insert(labels::MANAGED_BY.to_owned(), labels::MANAGER.to_owned());
    map.insert(labels::INSTANCE.to_owned(), project.to_owned());
    map
}

/// Builds the tenant namespace. Created by the controller, never by a Job.
pub fn tenant_namespace_object(project: &str) -> Namespace {
    Namespace {
        metadata: ObjectMeta {
            name: Some(tenant_namespace(project)),
            labels: Some(managed_labels(project)),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn rule(api_group: &str, resources: &[&str]) -> PolicyRule {
    PolicyRule {
        api_groups: Some(vec![api_group.to_owned()]),
        resources: Some(resources.iter().map(|r| r.to_string()).collect()),
        verbs: MANAGE.iter().map(|v| v.to_string()).collect(),
        ..Default::default()
    }
}

/// Per-tenant Role scoped to the tenant namespace. Owned by the namespace
/// so namespace deletion reaps it.
pub fn provisioner_role(namespace: &Namespace, project: &str) -> Role {
    Role {
        metadata: ObjectMeta {
            name: Some(ROLE_NAME.to_owned()),
            namespace: namespace.metadata.name.clone(),
            labels: Some(managed_labels(project)),
            owner_references: Some(vec![namespace.controller_owner_ref(&()).unwrap()]),
            ..Default::default()
        },
        rules: Some(vec![
            rule("", &["secrets", "configmaps", "services"]),
            rule("apps", &["deployments", "statefulsets"]),
            rule("networking.k8s.io", &["ingresses"]),
            rule("batch", &["jobs"]),
            rule("rbac.authorization.k8s.io", &["roles", "rolebindings"]),
        ]),
    }
}

/// Binds the provisioning service account (resident in the operator
/// namespace) to the per-tenant Role.
pub fn provisioner_role_binding(
    namespace: &Namespace,
    project: &str,
    config: &OperatorConfig,
) -> RoleBinding {
    RoleBinding {
        metadata: ObjectMeta {
            name: Some(ROLE_NAME.to_owned()),
            namespace: namespace.metadata.name.clone(),
            labels: Some(managed_labels(project)),
            owner_references: Some(vec![namespace.controller_owner_ref(&()).unwrap()]),
            ..Default::default()
        },
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_owned(),
            kind: "Role".to_owned(),
            name: ROLE_NAME.to_owned(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_owned(),
            name: config.provisioner_service_account.clone(),
            namespace: Some(config.operator_namespace.clone()),
            ..Default::default()
        }]),
    }
}

/// Ensures the tenant namespace exists, treating AlreadyExists as success.
/// Returns the live namespace so callers can parent RBAC objects to it.
pub async fn ensure_namespace(
    client: Client,
    instance: &SupabaseInstance,
) -> Result<Namespace, Error> {
    let project = &instance.spec.project_name;
    let api: Api<Namespace> = Api::all(client);
    let namespace = tenant_namespace_object(project);
    match api.create(&PostParams::default(), &namespace).await {
        Ok(created) => Ok(created),
        Err(kube::Error::Api(ae)) if ae.code == 409 => {
            Ok(api.get(&namespace.name_any()).await?)
        }
        Err(e) => Err(e.into()),
    }
}

/// Ensures the per-tenant Role and RoleBinding exist before any Job runs in
/// the tenant namespace. Both creations treat AlreadyExists as success.
pub async fn ensure_rbac(
    client: Client,
    namespace: &Namespace,
    instance: &SupabaseInstance,
    config: &OperatorConfig,
) -> Result<(), Error> {
    let project = &instance.spec.project_name;
    let tenant = namespace.name_any();

    let roles: Api<Role> = Api::namespaced(client.clone(), &tenant);
    match roles
        .create(&PostParams::default(), &provisioner_role(namespace, project))
        .await
    {
        Ok(_) => {}
        Err(kube::Error::Api(ae)) if ae.code == 409 => {}
        Err(e) => return Err(e.into()),
    }

    let bindings: Api<RoleBinding> = Api::namespaced(client, &tenant);
    match bindings
        .create(
            &PostParams::default(),
            &provisioner_role_binding(namespace, project, config),
        )
        .await
    {
        Ok(_) => {}
        Err(kube::Error::Api(ae)) if ae.code == 409 => {}
        Err(e) => return Err(e.into()),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

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

    fn namespace() -> Namespace {
        let mut namespace = tenant_namespace_object("demo");
        namespace.metadata.uid = Some("ns-uid-0001".to_owned());
        namespace
    }

    #[test]
    fn namespace_is_labeled_for_provenance() {
        let namespace = tenant_namespace_object("demo");
        assert_eq!(namespace.name_any(), "supa-demo");
        let labels = namespace.metadata.labels.as_ref().unwrap();
        assert_eq!(
            labels.get("app.kubernetes.io/managed-by").map(String::as_str),
            Some("supacontrol")
        );
        assert_eq!(labels.get("instance").map(String::as_str), Some("demo"));
    }

    #[test]
    fn role_grants_no_cluster_scoped_access() {
        let role = provisioner_role(&namespace(), "demo");
        assert_eq!(role.metadata.namespace.as_deref(), Some("supa-demo"));
        let rules = role.rules.as_ref().unwrap();
        let resources: Vec<&str> = rules
            .iter()
            .flat_map(|r| r.resources.as_ref().unwrap())
            .map(String::as_str)
            .collect();
        for expected in [
            "secrets",
            "configmaps",
            "services",
            "deployments",
            "statefulsets",
            "ingresses",
            "jobs",
            "roles",
            "rolebindings",
        ] {
            assert!(resources.contains(&expected), "missing {expected}");
        }
        // No rule may name namespaces, nodes or other cluster-scoped kinds.
        assert!(!resources.contains(&"namespaces"));
        assert!(rules.iter().all(|r| r.non_resource_urls.is_none()));
    }

    #[test]
    fn binding_targets_the_operator_service_account() {
        let binding = provisioner_role_binding(&namespace(), "demo", &config());
        assert_eq!(binding.role_ref.kind, "Role");
        assert_eq!(binding.role_ref.name, ROLE_NAME);
        let subject = &binding.subjects.as_ref().unwrap()[0];
        assert_eq!(subject.kind, "ServiceAccount");
        assert_eq!(subject.name, "supacontrol-provisioner");
        assert_eq!(subject.namespace.as_deref(), Some("supacontrol-system"));
    }

    #[test]
    fn rbac_objects_are_reaped_with_the_namespace() {
        let namespace = namespace();
        for owners in [
            provisioner_role(&namespace, "demo")
                .metadata
                .owner_references,
            provisioner_role_binding(&namespace, "demo", &config())
                .metadata
                .owner_references,
        ] {
            let owner = &owners.as_ref().unwrap()[0];
            assert_eq!(owner.kind, "Namespace");
            assert_eq!(owner.uid, "ns-uid-0001");
            assert_eq!(owner.controller, Some(true));
        }
    }
}
