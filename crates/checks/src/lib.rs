//! foursight-checks: the checks and actions a foursight deployment runs.
//!
//! The pipeline pairs drive workflow runs on the portal from creation to
//! linked outputs. The system checks watch the dispatcher's own queues and
//! the shared services.

pub mod pipeline;
pub mod system;

use foursight_engine::{Registry, RegistryBuilder, RegistryError};

/// Register every check and action of this crate.
pub fn register_all(builder: &mut RegistryBuilder) {
    pipeline::register(builder);
    system::register(builder);
}

/// The full catalogue.
pub fn registry() -> Result<Registry, RegistryError> {
    let mut builder = Registry::builder();
    register_all(&mut builder);
    builder.build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalogue_builds_and_links() {
        let registry = registry().unwrap();
        let checks: Vec<String> = registry
            .list_checks()
            .iter()
            .map(|c| c.name.clone())
            .collect();
        for name in [
            "runs_to_start",
            "runs_to_poll",
            "spot_failed_runs",
            "failed_runs",
            "runs_to_kill",
            "output_files_to_link",
            "qc_failed_runs",
            "runs_to_create",
            "deduplicate_secondary_queue",
            "search_cluster_health",
        ] {
            assert!(checks.contains(&name.to_string()), "{} missing", name);
        }
        assert_eq!(registry.list_actions().len(), 8);
    }

    #[test]
    fn groups_cover_the_schedule() {
        let registry = registry().unwrap();
        let ten_min: Vec<String> = registry
            .checks_in_group(pipeline::TEN_MIN_CHECKS)
            .iter()
            .map(|c| c.name.clone())
            .collect();
        assert_eq!(ten_min.len(), 4);
        assert!(ten_min.iter().all(|n| registry.get_check(n).unwrap().auto_action));
        assert_eq!(registry.checks_in_group(pipeline::MORNING_CHECKS).len(), 1);
        assert!(registry
            .groups()
            .iter()
            .all(|g| g.ends_with("_checks")));
        // Killing is never scheduled.
        assert!(registry.get_check("runs_to_kill").unwrap().schedule_groups.is_empty());
    }
}
