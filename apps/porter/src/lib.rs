//! # porter
//!
//! Library target of the `porter` binary. It exposes the CLI so the
//! integration tests can parse and execute commands in-process.

pub mod cli;
