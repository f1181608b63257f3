//! End-to-end scenarios spanning the policy server and a cell.
//!
//! Everything runs in-process: the policy server's APIs are served over
//! loopback HTTP, and each cell enforces into a recording packet filter that
//! the tests can push packets through.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod cell;
pub mod filter;
pub mod server;

pub use self::{
    cell::Cell,
    filter::{Packet, Trace, Verdict},
    server::PolicyServer,
};

pub fn init_tracing() -> tracing::subscriber::DefaultGuard {
    tracing::subscriber::set_default(
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "netpol=trace,debug".parse().unwrap()),
            )
            .finish(),
    )
}
