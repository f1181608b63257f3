//! The per-cell policy agent.
//!
//! Every poll the agent reads the containers attached to this cell, fetches
//! the policies that involve their groups, plans the packet-filter rules
//! those policies require, and swaps them into place.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod admin;
pub mod agent;
mod args;
pub mod client;
pub mod enforcer;
mod metrics;
pub mod planner;

pub use self::{
    admin::LoggingState,
    agent::Agent,
    args::Args,
    client::{InternalClient, PolicySource},
    enforcer::{ChainSpec, Enforcer},
    metrics::AgentMetrics,
    planner::{Planner, PlannerConfig},
};
