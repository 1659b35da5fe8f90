use kube::CustomResourceExt;
use std::fs;
use supacontrol_types::*;

fn main() {
    let _ = fs::create_dir("../crds");
    fs::write(
        "../crds/supacontrol.io_supabaseinstances.yaml",
        serde_yaml::to_string(&SupabaseInstance::crd()).unwrap(),
    )
    .unwrap();
}
