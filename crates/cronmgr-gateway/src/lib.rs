//! `cronmgr-gateway`: the `cm` and `process-job` entry points plus the HTTP API.

pub mod app;
pub mod cli;
pub mod http;
pub mod runtime;
