//! studio-webhook - admission-time live-development mutation
//!
//! Converts a normally deployed application into a live-development
//! deployment at pod admission time: registered containers are swapped for
//! dev-environment images running an in-browser editor, and every mutated
//! pod receives a proxy sidecar routing editor traffic to the right
//! container. No service objects or declared ports change; everything
//! happens through RFC 6902 patches returned from two mutating webhooks.

pub mod config;
pub mod error;
pub mod manifest;
pub mod proxy;
pub mod registry;
pub mod selector;
pub mod webhook;

pub use error::{Error, Result};
