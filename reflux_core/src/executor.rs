use crate::coverage::EdgeId;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::time::{Duration, Instant};
use tracing::debug;

/// Edges hit by one harness run.
///
/// Harnesses either report edge ids directly with [`EdgeTrace::hit`] or report
/// basic blocks with [`EdgeTrace::visit`], which derives AFL-style
/// `prev >> 1 ^ current` edge ids.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EdgeTrace {
    edges: Vec<EdgeId>,
    prev_block: u64,
}

impl EdgeTrace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hit(&mut self, edge: EdgeId) {
        self.edges.push(edge);
    }

    pub fn visit(&mut self, block: u64) {
        self.edges.push(self.prev_block ^ block);
        self.prev_block = block >> 1;
    }

    pub fn edges(&self) -> &[EdgeId] {
        &self.edges
    }

    pub fn into_edges(self) -> Vec<EdgeId> {
        self.edges
    }
}

/// Outcome of running one input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Execution {
    pub edges: Vec<EdgeId>,
    pub crashed: bool,
    pub crash_message: Option<String>,
    pub exec_time: Duration,
}

pub trait Executor: Send + Sync {
    fn execute(&self, input: &[u8]) -> Execution;
}

/// Runs a harness function in the current process, treating a panic as a crash.
///
/// Edges recorded before the panic are kept.
pub struct InProcessExecutor<F>
where
    F: Fn(&[u8], &mut EdgeTrace),
{
    harness_fn: F,
}

impl<F> InProcessExecutor<F>
where
    F: Fn(&[u8], &mut EdgeTrace),
{
    pub fn new(harness_fn: F) -> Self {
        Self { harness_fn }
    }
}

impl<F> Executor for InProcessExecutor<F>
where
    F: Fn(&[u8], &mut EdgeTrace) + Send + Sync,
{
    fn execute(&self, input: &[u8]) -> Execution {
        let mut trace = EdgeTrace::new();
        let started = Instant::now();
        let result = catch_unwind(AssertUnwindSafe(|| {
            (self.harness_fn)(input, &mut trace);
        }));
        let exec_time = started.elapsed();

        let crash_message = match result {
            Ok(()) => None,
            Err(panic_payload) => {
                let msg = if let Some(s) = panic_payload.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = panic_payload.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "Unknown panic type".to_string()
                };
                debug!(message = %msg, len = input.len(), "harness crashed");
                Some(msg)
            }
        };
        Execution {
            edges: trace.into_edges(),
            crashed: crash_message.is_some(),
            crash_message,
            exec_time,
        }
    }
}
