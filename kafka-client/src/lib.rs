pub mod codec;
pub mod config;
pub mod coordinator;
pub mod dead_letter;
pub mod error;
pub mod gate;
pub mod generation;
pub mod kafka;
pub mod message;
pub mod metrics_consts;
pub mod offsets;
pub mod partition_loop;
pub mod producer;
pub mod session;
pub mod test_utils;
pub mod topic;
