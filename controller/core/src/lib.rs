#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

//! The recommendation engine behind the Tortoise controller.
//!
//! Nothing in this crate talks to the API server. The runtime gathers a
//! [`engine::Snapshot`] of the objects a Tortoise depends on, calls
//! [`engine::plan`], and carries out the writes the returned
//! [`engine::Plan`] asks for.

pub mod conditions;
pub mod config;
pub mod engine;
mod error;
pub mod hpa;
pub mod hpa_target;
pub mod phase;
pub mod pod;
pub mod policy;
pub mod quantity;
pub mod recommendation;
pub mod replicas;
pub mod vertical;
pub mod workload;

pub use self::{
    config::{Config, GatheringDataPeriod, RawConfig},
    engine::{plan, Notice, NoticeType, Plan, Snapshot},
    error::Error,
    workload::Workload,
};

pub type Result<T, E = Error> = std::result::Result<T, E>;

pub const CONTROLLER_NAME: &str = "tortoise-controller";
