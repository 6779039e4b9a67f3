//! Selection of the jobs a gate releases.

use crate::job::Job;
use crate::policy::ReleaseSelection;
use std::collections::HashSet;

/// Pick the releasable jobs named by `selection` or by `override_step_key`.
///
/// A job is picked when it is releasable, has a step key, and that key is
/// listed explicitly, matches the selection's glob pattern (case-sensitive,
/// `*` crosses `/`), or equals the override key. The result is sorted by
/// step key and holds each job id once.
pub fn select_jobs(
    jobs: &[Job],
    selection: &ReleaseSelection,
    override_step_key: Option<&str>,
) -> Vec<Job> {
    let mut seen = HashSet::new();
    let mut selected: Vec<Job> = jobs
        .iter()
        .filter(|job| job.releasable)
        .filter(|job| match job.step_key.as_deref() {
            Some(key) => is_selected(key, selection, override_step_key),
            None => false,
        })
        .filter(|job| seen.insert(job.id.clone()))
        .cloned()
        .collect();

    selected.sort_by(|a, b| a.step_key.cmp(&b.step_key).then_with(|| a.id.cmp(&b.id)));
    selected
}

fn is_selected(key: &str, selection: &ReleaseSelection, override_step_key: Option<&str>) -> bool {
    selection.keys().contains(key)
        || selection.pattern().is_some_and(|p| p.matches(key))
        || override_step_key == Some(key)
}
