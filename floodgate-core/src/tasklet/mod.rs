//! Tasklets: cooperatively scheduled units of execution.
//!
//! A worker thread calls [`Tasklet::call`] over and over. Each call does a small
//! amount of work, never blocks, and reports whether it got anywhere.
//!
//! ```text
//! loop {
//!     match tasklet.call()? {
//!         MadeProgress => continue,
//!         NoProgress => back off,
//!         Done => drop tasklet,
//!     }
//! }
//! ```

use anyhow::Result;

mod processor_tasklet;

pub use processor_tasklet::*;

/// Outcome of one [`Tasklet::call`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressState {
    NoProgress,
    MadeProgress,
    /// The tasklet finished and must not be called again.
    Done,
}

impl ProgressState {
    pub fn is_done(self) -> bool {
        self == ProgressState::Done
    }

    pub fn made_progress(self) -> bool {
        self != ProgressState::NoProgress
    }
}

impl From<bool> for ProgressState {
    fn from(progress: bool) -> Self {
        if progress {
            ProgressState::MadeProgress
        } else {
            ProgressState::NoProgress
        }
    }
}

pub trait Tasklet: Send {
    fn name(&self) -> &str;

    /// Cooperative tasklets share worker threads; others get a thread of their own.
    fn is_cooperative(&self) -> bool;

    /// Higher-priority tasklets must finish before a snapshot may start on the member.
    fn is_higher_priority(&self) -> bool {
        false
    }

    /// Called once, on the thread that will run the tasklet, before the first call.
    fn init(&mut self) -> Result<()> {
        Ok(())
    }

    fn call(&mut self) -> Result<ProgressState>;
}

#[cfg(test)]
#[path = "tests/processor_tasklet_tests.rs"]
mod tests;
