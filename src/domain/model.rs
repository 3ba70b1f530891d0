use std::{collections::HashMap, fmt, sync::Arc};

use anyhow::Error;
use serde::{Deserialize, Serialize};

pub const PERSISTENT_VM_ROLE: &str = "PersistentVMRole";
pub const ROLE_STATUS_READY: &str = "ReadyRole";
pub const ROLE_STATUS_STOPPED: &str = "StoppedVM";
pub const ROLE_STATUS_STOPPED_DEALLOCATED: &str = "StoppedDeallocated";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    Stopped,
    Starting,
    Running,
    Stopping,
    Restarting,
    Error,
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            InstanceStatus::Stopped => "STOPPED",
            InstanceStatus::Starting => "STARTING",
            InstanceStatus::Running => "RUNNING",
            InstanceStatus::Stopping => "STOPPING",
            InstanceStatus::Restarting => "RESTARTING",
            InstanceStatus::Error => "ERROR",
        };
        f.write_str(label)
    }
}

/// Diagnostic attached to a client (configuration failure) or an instance
/// (remote operation failure).
#[derive(Clone, Debug)]
pub struct CloudErrorInfo {
    pub message: String,
    pub details: String,
    pub cause: Option<Arc<Error>>,
}

impl CloudErrorInfo {
    pub fn new(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            details: message.clone(),
            message,
            cause: None,
        }
    }

    pub fn from_error(error: Error) -> Self {
        let message = error.to_string();
        Self {
            details: message.clone(),
            message,
            cause: Some(Arc::new(error)),
        }
    }
}

impl fmt::Display for CloudErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Registration record of a running worker, used to find the instance it runs on.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AgentDescription {
    pub configuration_parameters: HashMap<String, String>,
}

impl AgentDescription {
    pub fn new(configuration_parameters: HashMap<String, String>) -> Self {
        Self {
            configuration_parameters,
        }
    }

    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.configuration_parameters.get(name).map(String::as_str)
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudInstanceUserData {
    pub agent_name: Option<String>,
    pub custom_parameters: HashMap<String, String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostedService {
    pub service_name: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Deployment {
    pub name: String,
    pub roles: Vec<Role>,
    pub role_instances: Vec<RoleInstance>,
}

impl Deployment {
    /// Role instances belonging to persistent VM roles of this deployment.
    pub fn persistent_vm_instances(&self) -> impl Iterator<Item = &RoleInstance> {
        self.role_instances.iter().filter(|instance| {
            self.roles.iter().any(|role| {
                role.is_persistent_vm() && role.role_name.eq_ignore_ascii_case(&instance.role_name)
            })
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Role {
    pub role_name: String,
    pub role_type: String,
}

impl Role {
    pub fn is_persistent_vm(&self) -> bool {
        self.role_type.eq_ignore_ascii_case(PERSISTENT_VM_ROLE)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoleInstance {
    pub role_name: String,
    pub instance_name: String,
    pub instance_status: String,
}

impl RoleInstance {
    /// A pooled VM is identified by its role name, compared case-insensitively.
    /// Remote commands are addressed with `instance_name`.
    pub fn matches_name(&self, name: &str) -> bool {
        self.role_name.eq_ignore_ascii_case(name)
    }

    pub fn is_ready(&self) -> bool {
        self.instance_status.eq_ignore_ascii_case(ROLE_STATUS_READY)
    }

    pub fn is_stopped(&self) -> bool {
        self.instance_status.eq_ignore_ascii_case(ROLE_STATUS_STOPPED)
            || self
                .instance_status
                .eq_ignore_ascii_case(ROLE_STATUS_STOPPED_DEALLOCATED)
    }
}

/// What the remote side does with a VM once it is shut down. Pooled VMs are
/// always deallocated so a stopped slot is not billed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PostShutdownAction {
    StoppedDeallocated,
}

impl PostShutdownAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            PostShutdownAction::StoppedDeallocated => "StoppedDeallocated",
        }
    }
}
