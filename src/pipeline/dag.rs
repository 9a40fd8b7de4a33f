//! Dependency resolution for pipeline jobs.
//!
//! Turns a set of jobs with name-based `depends_on` edges into ordered
//! execution batches. Every job in batch `k` depends only on jobs in batches
//! `< k`; jobs within a batch may run concurrently. Ordering within a batch is
//! deterministic: `job_order` ascending, then name ascending.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap, HashSet};

use crate::error::ValidationError;

use super::types::Job;

/// Resolves job dependency graphs into execution batches.
///
/// The resolver is pure: it reads no storage and holds no state.
#[derive(Debug, Clone, Copy, Default)]
pub struct DependencyResolver;

impl DependencyResolver {
    pub fn new() -> Self {
        Self
    }

    /// Validates the graph and returns the batches in execution order.
    ///
    /// An empty job set resolves to zero batches.
    ///
    /// # Errors
    ///
    /// - `ValidationError::DuplicateJobName` if two jobs share a name
    /// - `ValidationError::UnknownDependency` if a dependency names no job
    /// - `ValidationError::Cycle` if the graph is not acyclic (self-edges
    ///   included)
    pub fn resolve(&self, jobs: &[Job]) -> Result<Vec<Vec<Job>>, ValidationError> {
        let mut by_name: HashMap<&str, &Job> = HashMap::with_capacity(jobs.len());
        for job in jobs {
            if by_name.insert(job.name.as_str(), job).is_some() {
                return Err(ValidationError::DuplicateJobName(job.name.clone()));
            }
        }

        let mut ordered: Vec<&Job> = jobs.iter().collect();
        ordered.sort_by(|a, b| batch_order(a, b));

        // Dedupe edges so that `a` listed twice does not count twice.
        let mut deps: HashMap<&str, BTreeSet<&str>> = HashMap::with_capacity(jobs.len());
        for job in &ordered {
            let mut edges = BTreeSet::new();
            for dep in &job.depends_on {
                if !by_name.contains_key(dep.as_str()) {
                    return Err(ValidationError::UnknownDependency {
                        job: job.name.clone(),
                        missing: dep.clone(),
                    });
                }
                if dep == &job.name {
                    return Err(ValidationError::Cycle {
                        path: vec![job.name.clone(), job.name.clone()],
                    });
                }
                edges.insert(dep.as_str());
            }
            deps.insert(job.name.as_str(), edges);
        }

        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
        let mut in_degree: HashMap<&str, usize> = HashMap::with_capacity(jobs.len());
        for job in &ordered {
            let edges = &deps[job.name.as_str()];
            in_degree.insert(job.name.as_str(), edges.len());
            for dep in edges {
                dependents.entry(*dep).or_default().push(job.name.as_str());
            }
        }

        let mut ready: Vec<&Job> = ordered
            .iter()
            .copied()
            .filter(|job| in_degree[job.name.as_str()] == 0)
            .collect();
        let mut batches: Vec<Vec<Job>> = Vec::new();
        let mut placed = 0usize;

        while !ready.is_empty() {
            ready.sort_by(|a, b| batch_order(a, b));
            let mut next = Vec::new();
            for job in &ready {
                for dependent in dependents.get(job.name.as_str()).into_iter().flatten() {
                    if let Some(degree) = in_degree.get_mut(dependent) {
                        *degree -= 1;
                        if *degree == 0 {
                            next.push(by_name[dependent]);
                        }
                    }
                }
            }
            placed += ready.len();
            batches.push(ready.iter().map(|job| (*job).clone()).collect());
            ready = next;
        }

        if placed < jobs.len() {
            let remaining: HashSet<&str> = in_degree
                .iter()
                .filter(|(_, degree)| **degree > 0)
                .map(|(name, _)| *name)
                .collect();
            return Err(ValidationError::Cycle {
                path: find_cycle(&ordered, &deps, &remaining),
            });
        }

        Ok(batches)
    }

    /// Validates the graph without materialising batches.
    pub fn validate(&self, jobs: &[Job]) -> Result<(), ValidationError> {
        self.resolve(jobs).map(|_| ())
    }
}

fn batch_order(a: &Job, b: &Job) -> Ordering {
    a.job_order
        .cmp(&b.job_order)
        .then_with(|| a.name.cmp(&b.name))
}

/// Walks unresolved edges from the first unresolved job until a node repeats.
///
/// Every unresolved job has at least one unresolved dependency, so the walk
/// always closes a loop.
fn find_cycle(
    ordered: &[&Job],
    deps: &HashMap<&str, BTreeSet<&str>>,
    remaining: &HashSet<&str>,
) -> Vec<String> {
    let Some(start) = ordered
        .iter()
        .map(|job| job.name.as_str())
        .find(|name| remaining.contains(name))
    else {
        return Vec::new();
    };

    let mut path: Vec<&str> = vec![start];
    let mut current = start;
    loop {
        let next = deps
            .get(current)
            .and_then(|edges| edges.iter().copied().find(|dep| remaining.contains(dep)));
        let Some(next) = next else {
            return path.into_iter().map(String::from).collect();
        };
        if let Some(pos) = path.iter().position(|name| *name == next) {
            let mut cycle: Vec<String> = path[pos..].iter().map(|s| s.to_string()).collect();
            cycle.push(next.to_string());
            return cycle;
        }
        path.push(next);
        current = next;
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;

    fn job(pipeline: Uuid, name: &str, deps: &[&str]) -> Job {
        Job::new(pipeline, name, format!("nb-{}", name)).with_depends_on(deps.iter().copied())
    }

    fn names(batches: &[Vec<Job>]) -> Vec<Vec<String>> {
        batches
            .iter()
            .map(|b| b.iter().map(|j| j.name.clone()).collect())
            .collect()
    }

    #[test]
    fn test_single_job() {
        let p = Uuid::new_v4();
        let batches = DependencyResolver::new().resolve(&[job(p, "a", &[])]).unwrap();
        assert_eq!(names(&batches), vec![vec!["a"]]);
    }

    #[test]
    fn test_linear_chain() {
        let p = Uuid::new_v4();
        let jobs = vec![job(p, "c", &["b"]), job(p, "a", &[]), job(p, "b", &["a"])];
        let batches = DependencyResolver::new().resolve(&jobs).unwrap();
        assert_eq!(names(&batches), vec![vec!["a"], vec!["b"], vec!["c"]]);
    }

    #[test]
    fn test_diamond() {
        let p = Uuid::new_v4();
        let jobs = vec![
            job(p, "d", &["b", "c"]),
            job(p, "c", &["a"]),
            job(p, "b", &["a"]),
            job(p, "a", &[]),
        ];
        let batches = DependencyResolver::new().resolve(&jobs).unwrap();
        assert_eq!(names(&batches), vec![vec!["a"], vec!["b", "c"], vec!["d"]]);
    }

    #[test]
    fn test_parallel_roots_tie_break_on_order_then_name() {
        let p = Uuid::new_v4();
        let jobs = vec![
            job(p, "zeta", &[]).with_job_order(0),
            job(p, "beta", &[]).with_job_order(1),
            job(p, "alpha", &[]).with_job_order(1),
        ];
        let batches = DependencyResolver::new().resolve(&jobs).unwrap();
        assert_eq!(names(&batches), vec![vec!["zeta", "alpha", "beta"]]);
    }

    #[test]
    fn test_resolution_is_deterministic_across_input_orders() {
        let p = Uuid::new_v4();
        let mut jobs = vec![
            job(p, "e", &["c", "d"]),
            job(p, "a", &[]),
            job(p, "d", &["b"]),
            job(p, "c", &["a"]),
            job(p, "b", &[]),
        ];
        let first = names(&DependencyResolver::new().resolve(&jobs).unwrap());
        jobs.reverse();
        let second = names(&DependencyResolver::new().resolve(&jobs).unwrap());
        assert_eq!(first, second);
        assert_eq!(first, vec![vec!["a", "b"], vec!["c", "d"], vec!["e"]]);
    }

    #[test]
    fn test_every_dependency_lands_in_an_earlier_batch() {
        let p = Uuid::new_v4();
        let jobs = vec![
            job(p, "a", &[]),
            job(p, "b", &["a"]),
            job(p, "c", &["a", "b"]),
            job(p, "d", &[]),
            job(p, "e", &["d", "c"]),
        ];
        let batches = DependencyResolver::new().resolve(&jobs).unwrap();
        let position: HashMap<String, usize> = batches
            .iter()
            .enumerate()
            .flat_map(|(i, b)| b.iter().map(move |j| (j.name.clone(), i)))
            .collect();
        for j in &jobs {
            for dep in &j.depends_on {
                assert!(position[dep] < position[&j.name]);
            }
        }
    }

    #[test]
    fn test_cycle_detected_with_path() {
        let p = Uuid::new_v4();
        let jobs = vec![
            job(p, "a", &["c"]),
            job(p, "b", &["a"]),
            job(p, "c", &["b"]),
            job(p, "root", &[]),
        ];
        let err = DependencyResolver::new().resolve(&jobs).unwrap_err();
        match err {
            ValidationError::Cycle { path } => {
                assert_eq!(path.first(), path.last());
                assert_eq!(path.len(), 4);
                for name in ["a", "b", "c"] {
                    assert!(path.iter().any(|n| n == name));
                }
            }
            other => panic!("expected cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let p = Uuid::new_v4();
        let err = DependencyResolver::new()
            .resolve(&[job(p, "a", &["a"])])
            .unwrap_err();
        assert_eq!(
            err,
            ValidationError::Cycle {
                path: vec!["a".into(), "a".into()]
            }
        );
    }

    #[test]
    fn test_unknown_dependency() {
        let p = Uuid::new_v4();
        let err = DependencyResolver::new()
            .resolve(&[job(p, "a", &["ghost"])])
            .unwrap_err();
        assert_eq!(
            err,
            ValidationError::UnknownDependency {
                job: "a".into(),
                missing: "ghost".into()
            }
        );
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let p = Uuid::new_v4();
        let err = DependencyResolver::new()
            .resolve(&[job(p, "a", &[]), job(p, "a", &[])])
            .unwrap_err();
        assert_eq!(err, ValidationError::DuplicateJobName("a".into()));
    }

    #[test]
    fn test_empty_pipeline_has_no_batches() {
        let batches = DependencyResolver::new().resolve(&[]).unwrap();
        assert!(batches.is_empty());
    }

    #[test]
    fn test_repeated_dependency_counts_once() {
        let p = Uuid::new_v4();
        let jobs = vec![job(p, "a", &[]), job(p, "b", &["a", "a"])];
        let batches = DependencyResolver::new().resolve(&jobs).unwrap();
        assert_eq!(names(&batches), vec![vec!["a"], vec!["b"]]);
    }
}
