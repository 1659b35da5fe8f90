mod actions;
mod jobs;
mod planner;
mod rbac;
mod reconcile;

pub use reconcile::run;
