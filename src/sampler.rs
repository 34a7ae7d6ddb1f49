//! Priority-weighted sampling of job-type queues.
//!
//! Each fetch attempt asks the sampler for a fresh permutation of the
//! registered job types so that higher-priority queues are consulted first
//! more often, without ever starving low-priority ones.

use rand::Rng;

use crate::keys;

/// The six keys the fetch script needs for one job type, in script order.
#[derive(Debug, Clone)]
pub(crate) struct SampledQueue {
    pub priority: u32,
    pub jobs: String,
    pub in_progress: String,
    pub paused: String,
    pub lock: String,
    pub lock_info: String,
    pub max_concurrency: String,
}

#[derive(Debug, Default)]
pub(crate) struct PrioritySampler {
    samples: Vec<SampledQueue>,
}

impl PrioritySampler {
    pub fn add(&mut self, namespace: &str, pool_id: &str, name: &str, priority: u32) {
        self.samples.push(SampledQueue {
            priority,
            jobs: keys::jobs(namespace, name),
            in_progress: keys::jobs_in_progress(namespace, pool_id, name),
            paused: keys::jobs_paused(namespace, name),
            lock: keys::jobs_lock(namespace, name),
            lock_info: keys::jobs_lock_info(namespace, name),
            max_concurrency: keys::jobs_max_concurrency(namespace, name),
        });
    }

    /// Weighted shuffle: position i is filled by drawing from the not yet
    /// placed tail with probability proportional to priority.
    pub fn sample(&mut self) -> &[SampledQueue] {
        let mut rng = rand::rng();
        for i in 0..self.samples.len() {
            let remaining: u64 = self.samples[i..].iter().map(|s| s.priority as u64).sum();
            let mut draw = rng.random_range(0..remaining);
            for j in i..self.samples.len() {
                let priority = self.samples[j].priority as u64;
                if draw < priority {
                    self.samples.swap(i, j);
                    break;
                }
                draw -= priority;
            }
        }
        &self.samples
    }
}
