//! Scripted [`ToolRunner`] used by tests so no real binaries run.

use crate::process::{CancelFlag, ExitResult, Invocation, ToolRunner};
use anyhow::Result;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

type Step = Box<dyn FnOnce(&Invocation) -> Result<ExitResult> + Send>;

/// Replays a fixed sequence of outcomes, one per invocation, and records
/// every command line. Panics on an invocation beyond the script.
#[derive(Default)]
pub(crate) struct ScriptedRunner {
    script: Mutex<VecDeque<Step>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedRunner {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn expect<F>(self, step: F) -> Self
    where
        F: FnOnce(&Invocation) -> Result<ExitResult> + Send + 'static,
    {
        self.script.lock().unwrap().push_back(Box::new(step));
        self
    }

    /// Expect one invocation and let it succeed with empty output.
    pub(crate) fn expect_ok(self) -> Self {
        self.expect(|_| Ok(ExitResult::ok("")))
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn remaining(&self) -> usize {
        self.script.lock().unwrap().len()
    }
}

impl ToolRunner for ScriptedRunner {
    // Every tool looks installed; the scripted steps decide what each
    // invocation does.
    fn is_available(&self, _tool: &str) -> bool {
        true
    }

    fn run(&self, inv: &Invocation, cancel: &CancelFlag, _timeout: Duration) -> Result<ExitResult> {
        cancel.check()?;
        self.calls.lock().unwrap().push(inv.command_line());
        let step = match self.script.lock().unwrap().pop_front() {
            Some(step) => step,
            None => panic!("unexpected tool invocation: {}", inv.command_line()),
        };
        step(inv)
    }
}
