//! A Kubernetes controller that runs a recurring worker workload per `Check`
//! custom resource, tracks retries/escalation, and writes status back to the
//! resource's status subresource.

#[macro_use]
extern crate serde_derive;

pub mod config;
pub mod controller;
pub mod error;
pub mod escalate;
pub mod handler;
pub mod health;
pub mod k8s;
pub mod metrics_sink;
pub mod model;
pub mod queue;
pub mod runner;
pub mod service;
pub mod watcher;

pub use controller::Controller;
pub use error::Error;
