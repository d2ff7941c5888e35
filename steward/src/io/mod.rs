//! Side-effecting adapters: filesystem, child processes, git and the
//! operator's terminal.

pub mod audit;
pub mod config;
pub mod content_store;
pub mod context;
pub mod editor;
pub mod git;
pub mod init;
pub mod model;
pub mod process;
pub mod prompt;
pub mod review;
pub mod sandbox;
pub mod transcript;
