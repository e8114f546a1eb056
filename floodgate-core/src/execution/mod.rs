//! Running tasklets on threads.

mod job;
mod service;

pub use job::*;
pub use service::*;

#[cfg(test)]
#[path = "tests/execution_tests.rs"]
mod tests;
