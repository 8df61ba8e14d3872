//! The model-extraction state machine

mod classify;
mod combo;
mod context;
mod engine;
mod readsite;
mod reconcile;
mod sigtree;

#[cfg(test)]
mod tests;

pub use engine::{Engine, RunOptions};
