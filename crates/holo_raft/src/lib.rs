//! Consensus and write-ahead-log contract crate.
//!
//! This crate defines the interface surface a tablet peer consumes from its
//! replication stack: op-ids, hybrid time, replicate messages, consensus
//! rounds and their callback plumbing, and the log/anchor accounting used for
//! garbage collection. No engine lives here; higher layers supply a
//! `RaftConsensus` and a `Log` implementation and drive rounds through the
//! notification helpers.

pub mod raft;
