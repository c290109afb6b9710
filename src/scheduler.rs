//! Strategy-key partitioning.
//!
//! The [`TaskScheduler`] slices the evaluated key list into contiguous runs
//! of up to `maxContainersPerPod` keys, one pod (Task) per run. Inside a
//! pod the [`SubTaskScheduler`] batches the subtasks into ordered groups of
//! up to `maxConcurrentNumPerPod` members; groups run sequentially, members
//! concurrently.

use crate::config::SchedulerSpec;

/// Partitions strategy keys into per-pod slices.
#[derive(Debug, Clone, Copy)]
pub struct TaskScheduler {
    max_containers_per_pod: usize,
}

impl TaskScheduler {
    pub fn new(max_containers_per_pod: usize) -> Self {
        Self {
            max_containers_per_pod,
        }
    }

    /// Derive the effective per-pod container cap from the scheduler spec.
    ///
    /// `maxPodNum` is the dual cap: the keys are spread over at most that
    /// many pods. Zero (or both zero) means a single pod holds everything.
    pub fn from_spec(spec: &SchedulerSpec, key_count: usize) -> Self {
        if spec.max_containers_per_pod > 0 {
            return Self::new(spec.max_containers_per_pod);
        }
        if spec.max_pod_num > 0 {
            return Self::new(key_count.div_ceil(spec.max_pod_num).max(1));
        }
        Self::new(0)
    }

    /// Number of keys per pod. A cap of zero collapses to "everything in
    /// one pod".
    pub fn containers_per_pod(&self, key_count: usize) -> usize {
        if self.max_containers_per_pod == 0 {
            key_count.max(1)
        } else {
            self.max_containers_per_pod
        }
    }

    /// Split keys into contiguous runs in input order. The last run may be
    /// short; an empty key list yields a single empty run.
    pub fn partition(&self, keys: &[String]) -> Vec<Vec<String>> {
        if keys.is_empty() {
            return vec![Vec::new()];
        }
        let per_pod = self.containers_per_pod(keys.len());
        keys.chunks(per_pod).map(|chunk| chunk.to_vec()).collect()
    }
}

/// Batches a pod's subtasks into sequentially-run concurrency groups.
#[derive(Debug, Clone, Copy)]
pub struct SubTaskScheduler {
    max_concurrent_per_pod: usize,
}

impl SubTaskScheduler {
    pub fn new(max_concurrent_per_pod: usize) -> Self {
        Self {
            max_concurrent_per_pod,
        }
    }

    /// Effective concurrency for `member_count` subtasks. Zero means all
    /// members run concurrently.
    pub fn concurrency(&self, member_count: usize) -> usize {
        if self.max_concurrent_per_pod == 0 {
            member_count.max(1)
        } else {
            self.max_concurrent_per_pod.min(member_count.max(1))
        }
    }

    /// Partition subtasks into ordered groups of up to the concurrency cap.
    /// The union of the groups is exactly the input; groups are disjoint.
    pub fn schedule<T>(&self, subtasks: Vec<T>) -> Vec<Vec<T>> {
        if subtasks.is_empty() {
            return Vec::new();
        }
        let concurrency = self.concurrency(subtasks.len());
        let mut groups = Vec::with_capacity(subtasks.len().div_ceil(concurrency));
        let mut group = Vec::with_capacity(concurrency);
        for subtask in subtasks {
            group.push(subtask);
            if group.len() == concurrency {
                groups.push(std::mem::replace(&mut group, Vec::with_capacity(concurrency)));
            }
        }
        if !group.is_empty() {
            groups.push(group);
        }
        groups
    }
}
