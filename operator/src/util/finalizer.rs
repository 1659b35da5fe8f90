use crate::util::{Error, FINALIZER_NAME};
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, ResourceExt};
use serde_json::json;
use supacontrol_types::SupabaseInstance;

/// Returns true if the instance carries the cleanup finalizer.
pub fn is_present(instance: &SupabaseInstance) -> bool {
    instance.finalizers().iter().any(|f| f == FINALIZER_NAME)
}

/// Attaches the cleanup finalizer. This write must land before any
/// subordinate is created so a rapid create/delete sequence cannot leak
/// tenant resources.
pub async fn add(client: Client, instance: &SupabaseInstance) -> Result<SupabaseInstance, Error> {
    let api: Api<SupabaseInstance> = Api::all(client);
    // The leading `test` op pins the entire finalizer list as we observed
    // it, so a concurrent writer appending or reordering anywhere in the
    // array fails the whole patch; the 409 surfaces as a retry.
    let patch: json_patch::Patch = if instance.finalizers().is_empty() {
        serde_json::from_value(json!([
            { "op": "test", "path": "/metadata/finalizers", "value": null },
            { "op": "add", "path": "/metadata/finalizers", "value": [FINALIZER_NAME] }
        ]))?
    } else {
        serde_json::from_value(json!([
            { "op": "test", "path": "/metadata/finalizers", "value": instance.finalizers() },
            { "op": "add", "path": "/metadata/finalizers/-", "value": FINALIZER_NAME }
        ]))?
    };
    Ok(api
        .patch(
            &instance.name_any(),
            &PatchParams::default(),
            &Patch::Json::<SupabaseInstance>(patch),
        )
        .await?)
}

/// Detaches the cleanup finalizer, releasing the resource for garbage
/// collection. Calling this on an instance without the finalizer is a no-op,
/// which keeps the deletion path idempotent across crash-restarts.
pub async fn remove(client: Client, instance: &SupabaseInstance) -> Result<(), Error> {
    let Some(index) = instance
        .finalizers()
        .iter()
        .position(|f| f == FINALIZER_NAME)
    else {
        return Ok(());
    };
    let api: Api<SupabaseInstance> = Api::all(client);
    let patch: json_patch::Patch = serde_json::from_value(json!([
        { "op": "test", "path": format!("/metadata/finalizers/{index}"), "value": FINALIZER_NAME },
        { "op": "remove", "path": format!("/metadata/finalizers/{index}") }
    ]))?;
    api.patch(
        &instance.name_any(),
        &PatchParams::default(),
        &Patch::Json::<SupabaseInstance>(patch),
    )
    .await?;
    Ok(())
}
