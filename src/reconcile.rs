//! The reconciliation loop
//!
//! Every pass takes a fresh process snapshot, binds processes to rules and
//! diffs the implied shaping objects against the realized ones. Only the
//! difference reaches the backend, so an unchanged process set costs no
//! kernel operations at all.
//!
//! The loop exclusively owns the realized set. An object enters it only when
//! the backend reports success and leaves it only when the backend confirms
//! the object is gone, so a failed mutation is naturally retried on the next
//! pass.

use crate::backends::process::ProcessProvider;
use crate::backends::shaping::{Mutation, Operation, Outcome, ShapingBackend};
use crate::config::GlobalConfig;
use crate::error::{BackendError, SnapshotError};
use crate::matcher::{LiveBinding, bind};
use crate::plan::{ObjectSet, ShapingObject, ShapingPlan};
use crate::process::{ProcessIdentifier, ProcessSnapshot};
use crate::teardown::{TeardownReport, tear_down};
use std::collections::BTreeSet;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Consecutive snapshot failures between escalated log messages
pub const SNAPSHOT_FAILURE_ALERT: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Initializing,
    Polling,
    Applying,
    IdleWait,
    ShuttingDown,
    Terminated,
}

/// Mutation counts of one pass
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PassReport {
    /// Mutations the backend carried out, deletions of absent objects included
    pub applied: usize,
    /// Creates postponed because their parent is not realized yet
    pub deferred: usize,
    /// Binding creates for processes that exited meanwhile
    pub vanished: usize,
    pub failed: usize,
}

impl PassReport {
    /// Number of backend calls made during the pass
    pub fn backend_calls(&self) -> usize {
        self.applied + self.vanished + self.failed
    }
}

/// Order mutations so that parents exist before children and children are
/// gone before parents:
/// class creates (parents first), updates, attachment creates, attachment
/// deletes, class deletes (deepest first)
pub fn diff(desired: &ObjectSet, realized: &ObjectSet) -> Vec<Mutation> {
    let mut class_creates = Vec::new();
    let mut updates = Vec::new();
    let mut attachment_creates = Vec::new();
    let mut attachment_deletes = Vec::new();
    let mut class_deletes = Vec::new();

    for (key, object) in desired {
        match realized.get(key) {
            None if key.is_attachment() => {
                attachment_creates.push(Mutation::create(object.clone()))
            }
            None => class_creates.push(Mutation::create(object.clone())),
            Some(current) if current != object => updates.push(Mutation::update(object.clone())),
            Some(_) => {}
        }
    }

    for (key, object) in realized {
        if desired.contains_key(key) {
            continue;
        }
        if key.is_attachment() {
            attachment_deletes.push(Mutation::delete(object.clone()));
        } else {
            class_deletes.push(Mutation::delete(object.clone()));
        }
    }

    class_creates.sort_by_key(|mutation| mutation.object.depth());
    class_deletes.sort_by_key(|mutation| std::cmp::Reverse(mutation.object.depth()));

    class_creates
        .into_iter()
        .chain(updates)
        .chain(attachment_creates)
        .chain(attachment_deletes)
        .chain(class_deletes)
        .collect()
}

/// Drives a [`ShapingBackend`] towards the state implied by the live
/// processes
pub struct Reconciler<P, B> {
    config: GlobalConfig,
    plan: ShapingPlan,
    provider: P,
    backend: B,
    poll_interval: Duration,
    realized: ObjectSet,
    state: LoopState,
    known_overlaps: BTreeSet<ProcessIdentifier>,
    bound_labels: Vec<String>,
    snapshot_failures: u32,
}

impl<P: ProcessProvider, B: ShapingBackend> Reconciler<P, B> {
    pub fn new(
        config: GlobalConfig,
        plan: ShapingPlan,
        provider: P,
        backend: B,
        poll_interval: Duration,
    ) -> Self {
        Self {
            config,
            plan,
            provider,
            backend,
            poll_interval,
            realized: ObjectSet::new(),
            state: LoopState::Initializing,
            known_overlaps: BTreeSet::new(),
            bound_labels: Vec::new(),
            snapshot_failures: 0,
        }
    }

    /// Clear whatever a previous run left behind
    pub fn initialize(&mut self) -> Result<(), BackendError> {
        self.state = LoopState::Initializing;
        log::info!(
            "Using {} backend on {} (polling every {:?})",
            self.backend.name(),
            self.plan.interface,
            self.poll_interval
        );
        let result = self.backend.clear_stale();
        self.state = LoopState::Polling;
        result
    }

    /// One poll-bind-diff-apply pass
    pub fn reconcile_once(&mut self) -> Result<PassReport, SnapshotError> {
        self.state = LoopState::Polling;
        let snapshot = match self.provider.snapshot() {
            Ok(snapshot) => snapshot,
            Err(e) => {
                self.snapshot_failures += 1;
                if self.snapshot_failures % SNAPSHOT_FAILURE_ALERT == 0 {
                    log::error!(
                        "{} consecutive snapshot failures, shaping is not being updated: {}",
                        self.snapshot_failures,
                        e
                    );
                } else {
                    log::warn!("Skipping pass: {}", e);
                }
                self.state = LoopState::IdleWait;
                return Err(e);
            }
        };
        self.snapshot_failures = 0;

        let binding = bind(&self.config.rules, &snapshot);
        self.report_overlaps(&binding, &snapshot);
        self.report_bound_rules(&binding);

        self.state = LoopState::Applying;
        let desired = self.plan.desired_state(&binding);
        let report = self.apply(diff(&desired, &self.realized));
        if let Err(e) = self.backend.sweep(&self.realized) {
            log::warn!("Failed to release processes no rule owns: {}", e);
        }
        self.state = LoopState::IdleWait;

        if report.backend_calls() > 0 || report.deferred > 0 {
            log::debug!(
                "Pass complete: {} applied, {} deferred, {} vanished, {} failed",
                report.applied,
                report.deferred,
                report.vanished,
                report.failed
            );
        }
        Ok(report)
    }

    fn apply(&mut self, mutations: Vec<Mutation>) -> PassReport {
        let mut report = PassReport::default();

        for mutation in mutations {
            let key = mutation.object.key().clone();

            if mutation.operation != Operation::Delete {
                if let Some(parent) = mutation.object.parent() {
                    if !self.realized.contains_key(parent) {
                        log::debug!("Deferring {}: {} is not in place", mutation, parent);
                        report.deferred += 1;
                        continue;
                    }
                }
            }

            match self.backend.apply(&mutation) {
                Ok(Outcome::Applied) => {
                    report.applied += 1;
                    match mutation.operation {
                        Operation::Create | Operation::Update => {
                            log::debug!("{}", mutation);
                            self.realized.insert(key, mutation.object);
                        }
                        Operation::Delete => {
                            log::debug!("{}", mutation);
                            self.realized.remove(&key);
                        }
                    }
                }
                Ok(Outcome::NotFound) => match mutation.operation {
                    Operation::Create => {
                        match &mutation.object {
                            ShapingObject::Binding(binding) => log::debug!(
                                "PID {} exited before it could be bound",
                                binding.process.pid
                            ),
                            _ => log::warn!("Backend could not find the target of {}", mutation),
                        }
                        report.vanished += 1;
                    }
                    Operation::Update => {
                        // Recreated on the next pass
                        log::warn!("{} disappeared, will recreate it", key);
                        self.realized.remove(&key);
                        report.applied += 1;
                    }
                    Operation::Delete => {
                        self.realized.remove(&key);
                        report.applied += 1;
                    }
                },
                Err(e) => {
                    log::warn!("Failed to {}: {}", mutation, e);
                    report.failed += 1;
                }
            }
        }

        report
    }

    fn report_overlaps(&mut self, binding: &LiveBinding, snapshot: &ProcessSnapshot) {
        let overlaps = binding.overlaps();
        for (process, labels) in overlaps {
            if self.known_overlaps.insert(*process) {
                let name = snapshot
                    .get(process.pid)
                    .map(|record| record.display_name().into_owned())
                    .unwrap_or_else(|| format!("PID {}", process.pid));
                log::warn!(
                    "{} (PID {}) matches rules {:?}, only {:?} applies",
                    name,
                    process.pid,
                    labels,
                    labels[0]
                );
            }
        }
        self.known_overlaps
            .retain(|process| overlaps.contains_key(process));
    }

    fn report_bound_rules(&mut self, binding: &LiveBinding) {
        let labels: Vec<String> = binding
            .bound_rules()
            .map(|rule_binding| {
                log::debug!(
                    "Shaping traffic for '{}' ({} process(es))",
                    rule_binding.label,
                    rule_binding.processes.len()
                );
                rule_binding.label.clone()
            })
            .collect();

        if labels != self.bound_labels {
            if labels.is_empty() {
                log::info!("No running process matches any rule");
            } else {
                log::info!(
                    "Shaping traffic for: {} ({} process(es))",
                    labels.join(", "),
                    binding.total_bound()
                );
            }
            self.bound_labels = labels;
        }
    }

    /// Remove every realized object
    pub fn shutdown(&mut self) -> TeardownReport {
        self.state = LoopState::ShuttingDown;
        let report = tear_down(&mut self.backend, &mut self.realized);
        self.state = LoopState::Terminated;
        report
    }

    /// Reconcile until `cancel` fires, then tear everything down
    pub async fn run(&mut self, cancel: CancellationToken) -> TeardownReport {
        if let Err(e) = self.initialize() {
            log::warn!("Failed to clear stale shaping state: {}", e);
        }

        while !cancel.is_cancelled() {
            // Snapshot failures are logged and retried after the interval
            let _ = self.reconcile_once();

            self.state = LoopState::IdleWait;
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }

        log::info!("Shutting down, removing shaping from {}...", self.plan.interface);
        self.shutdown()
    }
}

#[cfg(test)]
impl<P, B> Reconciler<P, B> {
    fn state(&self) -> LoopState {
        self.state
    }

    fn realized(&self) -> &ObjectSet {
        &self.realized
    }

    fn provider_mut(&mut self) -> &mut P {
        &mut self.provider
    }

    fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    fn backend(&self) -> &B {
        &self.backend
    }
}
