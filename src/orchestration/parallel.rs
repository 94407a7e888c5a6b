//! Parallel groups for fan-out inside a single job.
//!
//! A `ParallelGroup` belongs to exactly one running attempt of one job. Its
//! members are not jobs: they never appear in the DAG and have no retry
//! budget of their own. The owning job succeeds only if every member does.
//! A member failure fails the attempt, and the job's own retry budget may
//! then re-run the whole group.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::error::{Error, Result};
use crate::{slog_debug, slog_warn};

/// Terminal outcome of one group member.
#[derive(Debug)]
pub struct MemberOutcome {
    /// Position in dispatch order.
    pub index: usize,
    pub label: String,
    pub result: Result<Value>,
}

impl MemberOutcome {
    pub fn succeeded(&self) -> bool {
        self.result.is_ok()
    }
}

/// Bounded set of concurrently running sub-operations plus a join barrier.
pub struct ParallelGroup {
    owner: String,
    limit: Arc<Semaphore>,
    members: JoinSet<MemberOutcome>,
    labels: HashMap<tokio::task::Id, (usize, String)>,
    dispatched: usize,
}

impl ParallelGroup {
    /// Create a group for job `owner` running at most `max_members` members
    /// at once.
    pub fn new(owner: &str, max_members: usize) -> Self {
        Self {
            owner: owner.to_string(),
            limit: Arc::new(Semaphore::new(max_members.max(1))),
            members: JoinSet::new(),
            labels: HashMap::new(),
            dispatched: 0,
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Number of members dispatched so far.
    pub fn len(&self) -> usize {
        self.dispatched
    }

    pub fn is_empty(&self) -> bool {
        self.dispatched == 0
    }

    /// Dispatch a member. It starts as soon as a worker slot is free.
    pub fn spawn<F>(&mut self, label: impl Into<String>, member: F)
    where
        F: Future<Output = Result<Value>> + Send + 'static,
    {
        let label = label.into();
        let index = self.dispatched;
        self.dispatched += 1;

        let limit = Arc::clone(&self.limit);
        let task_label = label.clone();
        let handle = self.members.spawn(async move {
            let result = match limit.acquire_owned().await {
                Ok(_permit) => member.await,
                Err(_) => Err(Error::TaskJoin("parallel group closed".into())),
            };
            MemberOutcome {
                index,
                label: task_label,
                result,
            }
        });
        slog_debug!("job {}: dispatched parallel member {} ({})", self.owner, index, label);
        self.labels.insert(handle.id(), (index, label));
    }

    /// Block until every member is terminal.
    ///
    /// Outcomes are returned in dispatch order. A member that panicked is
    /// reported as a failed member.
    pub async fn join(mut self) -> GroupReport {
        let mut outcomes = Vec::with_capacity(self.dispatched);
        while let Some(joined) = self.members.join_next_with_id().await {
            match joined {
                Ok((_, outcome)) => outcomes.push(outcome),
                Err(e) => {
                    let (index, label) = self
                        .labels
                        .remove(&e.id())
                        .unwrap_or((usize::MAX, "unknown".to_string()));
                    slog_warn!("job {}: parallel member {} aborted: {}", self.owner, label, e);
                    outcomes.push(MemberOutcome {
                        index,
                        label: label.clone(),
                        result: Err(Error::ParallelMember {
                            member: label,
                            error: e.to_string(),
                        }),
                    });
                }
            }
        }
        outcomes.sort_by_key(|o| o.index);
        GroupReport {
            owner: self.owner,
            outcomes,
        }
    }

    /// Abort every member still running. Used when the owning attempt is
    /// abandoned.
    pub fn abort(mut self) {
        if !self.members.is_empty() {
            slog_debug!(
                "job {}: aborting {} parallel member(s)",
                self.owner,
                self.members.len()
            );
        }
        self.members.abort_all();
    }
}

impl std::fmt::Debug for ParallelGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParallelGroup")
            .field("owner", &self.owner)
            .field("dispatched", &self.dispatched)
            .field("running", &self.members.len())
            .finish()
    }
}

/// Outcomes of a joined group.
#[derive(Debug)]
pub struct GroupReport {
    pub owner: String,
    pub outcomes: Vec<MemberOutcome>,
}

impl GroupReport {
    pub fn total(&self) -> usize {
        self.outcomes.len()
    }

    pub fn failed_count(&self) -> usize {
        self.outcomes.iter().filter(|o| !o.succeeded()).count()
    }

    pub fn all_succeeded(&self) -> bool {
        self.failed_count() == 0
    }

    /// Member outputs in dispatch order, or a group error if any member
    /// failed.
    pub fn into_result(self) -> Result<Vec<Value>> {
        let failures: Vec<(String, String)> = self
            .outcomes
            .iter()
            .filter_map(|o| match &o.result {
                Err(e) => Some((o.label.clone(), e.to_string())),
                Ok(_) => None,
            })
            .collect();
        if !failures.is_empty() {
            for (member, error) in &failures {
                slog_warn!("job {}: member {} failed: {}", self.owner, member, error);
            }
            return Err(Error::ParallelGroup {
                failed: failures.len(),
                total: self.outcomes.len(),
                failures,
            });
        }
        Ok(self
            .outcomes
            .into_iter()
            .filter_map(|o| o.result.ok())
            .collect())
    }
}
