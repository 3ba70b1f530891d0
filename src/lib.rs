//! Pool of pre-provisioned cloud VMs used as elastic build-agent capacity.

pub mod config;
pub mod domain;
pub mod infra;

pub use domain::{
    model::{AgentDescription, CloudErrorInfo, CloudInstanceUserData, InstanceStatus},
    CloudClient, CloudImage, CloudInstance,
};
