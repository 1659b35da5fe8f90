use clap::Parser;

/// Cluster-level defaults for the operator process. Everything here is read
/// once at startup from flags or the environment; none of it is
/// per-instance (instances override the ingress knobs through their spec).
#[derive(Parser, Debug, Clone)]
pub struct OperatorConfig {
    /// Helm repository that hosts the Supabase chart.
    #[arg(
        long,
        env = "CHART_REPO",
        default_value = "https://supabase-community.github.io/supabase-kubernetes"
    )]
    pub chart_repo: String,

    /// Chart name inside the repository.
    #[arg(long, env = "CHART_NAME", default_value = "supabase")]
    pub chart_name: String,

    /// Chart version installed when the spec does not pin one.
    #[arg(long, env = "CHART_VERSION", default_value = "0.1.3")]
    pub chart_version: String,

    /// Ingress class used when the spec does not pin one.
    #[arg(long, env = "INGRESS_CLASS", default_value = "nginx")]
    pub ingress_class: String,

    /// Domain under which per-instance studio/API hosts are published.
    #[arg(long, env = "INGRESS_DOMAIN", default_value = "supacontrol.local")]
    pub ingress_domain: String,

    /// cert-manager issuer for tenant ingress certificates.
    #[arg(long, env = "CERT_ISSUER", default_value = "letsencrypt-prod")]
    pub cert_issuer: String,

    /// Namespace the operator, its lease and its Jobs live in.
    #[arg(long, env = "OPERATOR_NAMESPACE", default_value = "supacontrol-system")]
    pub operator_namespace: String,

    /// Service account the provisioning and cleanup Jobs run as. Resides in
    /// the operator namespace; per-tenant RoleBindings grant it access to
    /// exactly one tenant namespace each.
    #[arg(
        long,
        env = "PROVISIONER_SERVICE_ACCOUNT",
        default_value = "supacontrol-provisioner"
    )]
    pub provisioner_service_account: String,
}
