//! Plan tree materialised from a resolved target.
//!
//! Construction is pure: a caller-supplied job factory maps workspace
//! names to jobs, so tests can substitute scripted stand-ins for the
//! subprocess variant. The root plan exclusively owns its subtree; leaves
//! sit behind `Arc` only so the signal supervisor and output pumps can
//! hold a job while it is in flight.

use std::sync::Arc;

use crate::manifest::Target;

/// One node of the runnable tree: leaf jobs, parallel children, and an
/// optional serial successor.
pub struct Plan<J> {
    pub name: String,
    pub jobs: Vec<Arc<J>>,
    pub group: Vec<Plan<J>>,
    pub next: Option<Box<Plan<J>>>,
}

impl<J> Plan<J> {
    /// Expand `target` 1:1 into a plan, creating one job per workspace.
    /// No I/O happens here.
    pub fn build<F>(target: &Target, factory: &F) -> Self
    where
        F: Fn(&str) -> J,
    {
        let group = target
            .group
            .iter()
            .map(|child| Plan::build(child, factory))
            .collect();
        let jobs = target
            .workspaces
            .iter()
            .map(|workspace| Arc::new(factory(workspace)))
            .collect();
        let next = target
            .next
            .as_deref()
            .map(|next| Box::new(Plan::build(next, factory)));
        Plan {
            name: target.name.clone(),
            jobs,
            group,
            next,
        }
    }

    /// Total number of leaf jobs in the subtree.
    pub fn job_count(&self) -> usize {
        let mut count = self.jobs.len();
        for child in &self.group {
            count += child.job_count();
        }
        if let Some(next) = &self.next {
            count += next.job_count();
        }
        count
    }
}
