use super::MANAGER_NAME;
use crate::util::Error;
use kube::{
    Api, Client,
    api::{Patch, PatchParams, Resource},
    core::ClusterResourceScope,
};
use serde::{Serialize, de::DeserializeOwned};
use std::{clone::Clone, fmt::Debug};
use supacontrol_types::*;

/// How often a conflicting status write is retried against a re-fetched
/// resource before the reconcile pass gives up.
const PATCH_ATTEMPTS: u32 = 3;

pub trait Object<S: Status> {
    /// Returns a mutable reference to the status object, initializing
    /// it with the default value if it does not exist.
    fn mut_status(&mut self) -> &mut S;
}

pub trait Status {
    /// Sets the last updated timestamp to the given value.
    fn set_last_updated(&mut self, last_updated: String);
}

impl Object<SupabaseInstanceStatus> for SupabaseInstance {
    fn mut_status(&mut self) -> &mut SupabaseInstanceStatus {
        if self.status.is_some() {
            return self.status.as_mut().unwrap();
        }
        self.status = Some(Default::default());
        self.status.as_mut().unwrap()
    }
}

impl Status for SupabaseInstanceStatus {
    fn set_last_updated(&mut self, last_updated: String) {
        self.last_updated = Some(last_updated);
    }
}

/// Patch the resource's status object with the provided function.
/// The function is passed a mutable reference to the status object,
/// which is to be mutated in-place. Move closures are supported.
///
/// The mutation is applied to a fresh copy and retried whenever the status
/// subresource update hits a stale resourceVersion, so the closure must be
/// safe to run more than once.
pub async fn patch_status<S: Status, T>(
    client: Client,
    instance: &T,
    f: impl Fn(&mut S),
) -> Result<T, Error>
where
    <T as Resource>::DynamicType: Default,
    T: Clone
        + Resource
        + Object<S>
        + Serialize
        + DeserializeOwned
        + Debug
        + Resource<Scope = ClusterResourceScope>,
{
    let name = instance.meta().name.as_deref().unwrap().to_owned();
    let api: Api<T> = Api::all(client);
    let mut current = instance.clone();
    for attempt in 1..=PATCH_ATTEMPTS {
        let patch = Patch::Json::<T>({
            let mut modified = current.clone();
            let status = modified.mut_status();
            f(status);
            status.set_last_updated(chrono::Utc::now().to_rfc3339());
            json_patch::diff(
                &serde_json::to_value(&current)?,
                &serde_json::to_value(&modified)?,
            )
        });
        match api
            .patch_status(&name, &PatchParams::apply(MANAGER_NAME), &patch)
            .await
        {
            Ok(updated) => return Ok(updated),
            Err(kube::Error::Api(ae)) if ae.code == 409 && attempt < PATCH_ATTEMPTS => {
                current = api.get(&name).await?;
            }
            Err(e) => return Err(e.into()),
        }
    }
    Err(Error::StatusConflict {
        name,
        attempts: PATCH_ATTEMPTS,
    })
}
