//! Attaches containers to the cell's network.
//!
//! The container runtime runs the driver once per container lifecycle event.
//! `up` pins the container's network namespace, reserves ingress ports, runs
//! the plugin chain, and records the container for the cell agent; `down`
//! reverses each step.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod args;
mod config;
mod error;
pub mod manager;
pub mod mount;
pub mod plugin;
pub mod ports;
pub mod redirect;

pub use self::{
    args::{Action, Args},
    config::Config,
    error::{Error, Result},
    manager::{Manager, UpInputs, UpOutputs},
    mount::{BindMounter, Mounter},
    plugin::{CniChain, PluginChain},
    ports::PortAllocator,
    redirect::{Redirect, SidecarRedirect},
};
