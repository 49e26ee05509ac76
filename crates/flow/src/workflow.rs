//! Composable workflow steps.

use std::sync::Arc;
use std::thread;

use tracing::trace;

use crate::event::Event;

type StepFn = Arc<dyn Fn(&Event) -> bool + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    Condition,
    Action,
    Sequential,
    Parallel,
}

/// Where a step is in its `Pending → Running → terminal` lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

/// One node of a workflow tree.
///
/// - `Condition`: evaluates its predicate; a false predicate skips the
///   step and leaves its children untouched, a true one runs the
///   children in order.
/// - `Action`: runs its action; children run in order only after the
///   action succeeds.
/// - `Sequential`: runs children in order, stopping at the first failure;
///   skipped children do not fail the run.
/// - `Parallel`: runs all children concurrently and joins them all; the
///   step completes only if every child completed. A failed (or skipped)
///   child fails the step without interrupting its siblings.
pub struct WorkflowStep {
    name: String,
    kind: StepKind,
    status: StepStatus,
    condition: Option<StepFn>,
    action: Option<StepFn>,
    children: Vec<WorkflowStep>,
}

impl WorkflowStep {
    pub fn condition(
        name: impl Into<String>,
        predicate: impl Fn(&Event) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self::new(name, StepKind::Condition, Some(Arc::new(predicate)), None)
    }

    pub fn action(
        name: impl Into<String>,
        action: impl Fn(&Event) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self::new(name, StepKind::Action, None, Some(Arc::new(action)))
    }

    pub fn sequential(name: impl Into<String>) -> Self {
        Self::new(name, StepKind::Sequential, None, None)
    }

    pub fn parallel(name: impl Into<String>) -> Self {
        Self::new(name, StepKind::Parallel, None, None)
    }

    fn new(
        name: impl Into<String>,
        kind: StepKind,
        condition: Option<StepFn>,
        action: Option<StepFn>,
    ) -> Self {
        WorkflowStep {
            name: name.into(),
            kind,
            status: StepStatus::Pending,
            condition,
            action,
            children: Vec::new(),
        }
    }

    /// Append a child step (builder style).
    pub fn child(mut self, child: WorkflowStep) -> Self {
        self.children.push(child);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> StepKind {
        self.kind
    }

    pub fn status(&self) -> StepStatus {
        self.status
    }

    pub fn children(&self) -> &[WorkflowStep] {
        &self.children
    }

    /// Find a step by name in this subtree.
    pub fn find(&self, name: &str) -> Option<&WorkflowStep> {
        if self.name == name {
            return Some(self);
        }
        self.children.iter().find_map(|c| c.find(name))
    }

    /// Return the whole subtree to `Pending`.
    pub fn reset(&mut self) {
        for child in &mut self.children {
            child.reset();
        }
        self.status = StepStatus::Pending;
    }

    /// Run this step against `event`. Returns whether the step
    /// completed; consult [`status`](WorkflowStep::status) for the full
    /// verdict.
    pub fn execute(&mut self, event: &Event) -> bool {
        self.status = StepStatus::Running;
        trace!(target: "flow", step = %self.name, kind = ?self.kind, "step running");

        self.status = match self.kind {
            StepKind::Condition => {
                let predicate = self
                    .condition
                    .as_ref()
                    .expect("condition step without predicate")
                    .clone();
                if predicate(event) {
                    if Self::run_in_order(&mut self.children, event) {
                        StepStatus::Completed
                    } else {
                        StepStatus::Failed
                    }
                } else {
                    StepStatus::Skipped
                }
            }
            StepKind::Action => {
                let action = self
                    .action
                    .as_ref()
                    .expect("action step without action")
                    .clone();
                if action(event) && Self::run_in_order(&mut self.children, event) {
                    StepStatus::Completed
                } else {
                    StepStatus::Failed
                }
            }
            StepKind::Sequential => {
                if Self::run_in_order(&mut self.children, event) {
                    StepStatus::Completed
                } else {
                    StepStatus::Failed
                }
            }
            StepKind::Parallel => {
                thread::scope(|scope| {
                    for child in &mut self.children {
                        scope.spawn(move || child.execute(event));
                    }
                });
                // Unlike a sequence, a parallel group completes only
                // when every child completed; a skipped child fails it.
                if self
                    .children
                    .iter()
                    .all(|c| c.status == StepStatus::Completed)
                {
                    StepStatus::Completed
                } else {
                    StepStatus::Failed
                }
            }
        };

        trace!(target: "flow", step = %self.name, status = ?self.status, "step finished");
        self.status == StepStatus::Completed
    }

    /// Run children in order, stopping at the first failure. Skipped
    /// children do not fail the run.
    fn run_in_order(children: &mut [WorkflowStep], event: &Event) -> bool {
        for child in children {
            child.execute(event);
            if child.status == StepStatus::Failed {
                return false;
            }
        }
        true
    }
}
