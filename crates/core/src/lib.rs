//! Dataflow execution engine: runs a workspace of typed, interconnected nodes
//! with one worker thread per node.

pub mod config;
pub mod engine;
pub mod failure;
pub mod graph;
pub mod logging;
pub mod node;
pub mod nodes;
pub mod progress;
pub mod propagation;
pub mod registry;
pub mod types;
pub mod view;
mod worker;
pub mod workspace;
