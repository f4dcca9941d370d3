//! Everything that talks to the kubernetes API

pub mod client;
pub mod crd;

pub use client::{ClusterClient, ClusterEvent, JobPhase, KubeClusterClient};
pub use crd::{Check, CheckSpec, CheckStatusRaw};
