//! Runs the policy server: the external and internal APIs, the reconciler
//! and the admin server.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod args;
pub mod inventory;
pub mod lease;
pub mod reconciler;
pub mod uaa;
mod upstream;

#[cfg(test)]
mod test_server;

pub use self::args::Args;
