//! In-memory compute management backend for unit tests.

use std::{sync::Arc, time::Duration};

use anyhow::{anyhow, Error};
use async_trait::async_trait;
use parking_lot::Mutex;

use super::{
    executor::SerialExecutor,
    instance::InstanceContext,
    model::{Deployment, HostedService, PostShutdownAction, Role, RoleInstance, PERSISTENT_VM_ROLE},
    port::{ComputeConnector, ComputeManagement},
    publish_settings::{ManagementCertificate, PublishSettings},
};

/// One hosted service `svc` with one deployment `prod` holding the configured VMs.
pub(crate) struct FakeCompute {
    vms: Mutex<Vec<RoleInstance>>,
    calls: Mutex<Vec<String>>,
    connect_failure: Mutex<Option<String>>,
    operation_delay: Mutex<Duration>,
}

impl FakeCompute {
    pub(crate) fn with_vms(vms: &[(&str, &str)]) -> Arc<Self> {
        Arc::new(Self {
            vms: Mutex::new(
                vms.iter()
                    .map(|(name, status)| RoleInstance {
                        role_name: name.to_string(),
                        instance_name: name.to_string(),
                        instance_status: status.to_string(),
                    })
                    .collect(),
            ),
            calls: Mutex::new(Vec::new()),
            connect_failure: Mutex::new(None),
            operation_delay: Mutex::new(Duration::ZERO),
        })
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub(crate) fn fail_connect(&self, message: &str) {
        *self.connect_failure.lock() = Some(message.to_string());
    }

    pub(crate) fn recover(&self) {
        *self.connect_failure.lock() = None;
    }

    pub(crate) fn delay_operations(&self, delay: Duration) {
        *self.operation_delay.lock() = delay;
    }

    fn set_remote_status(&self, instance_name: &str, status: &str) {
        for vm in self.vms.lock().iter_mut() {
            if vm.instance_name == instance_name {
                vm.instance_status = status.to_string();
            }
        }
    }
}

struct FakeSession(Arc<FakeCompute>);

#[async_trait]
impl ComputeConnector for Arc<FakeCompute> {
    async fn connect(
        &self,
        _subscription_id: &str,
        _publish_settings: &PublishSettings,
    ) -> Result<Box<dyn ComputeManagement + Send + Sync>, Error> {
        let failure = self.connect_failure.lock().clone();
        match failure {
            Some(message) => Err(anyhow!(message)),
            None => Ok(Box::new(FakeSession(self.clone()))),
        }
    }
}

#[async_trait]
impl ComputeManagement for FakeSession {
    async fn list_hosted_services(&self) -> Result<Vec<HostedService>, Error> {
        Ok(vec![HostedService {
            service_name: "svc".to_string(),
        }])
    }

    async fn get_deployments(&self, _service_name: &str) -> Result<Vec<Deployment>, Error> {
        let role_instances = self.0.vms.lock().clone();
        Ok(vec![Deployment {
            name: "prod".to_string(),
            roles: role_instances
                .iter()
                .map(|vm| Role {
                    role_name: vm.role_name.clone(),
                    role_type: PERSISTENT_VM_ROLE.to_string(),
                })
                .collect(),
            role_instances,
        }])
    }

    async fn start_role_instance(
        &self,
        service_name: &str,
        deployment_name: &str,
        instance_name: &str,
    ) -> Result<(), Error> {
        let delay = *self.0.operation_delay.lock();
        tokio::time::sleep(delay).await;
        self.0
            .calls
            .lock()
            .push(format!("start {}/{}/{}", service_name, deployment_name, instance_name));
        self.0.set_remote_status(instance_name, "ReadyRole");
        Ok(())
    }

    async fn shutdown_role_instance(
        &self,
        service_name: &str,
        deployment_name: &str,
        instance_name: &str,
        post_shutdown_action: PostShutdownAction,
    ) -> Result<(), Error> {
        let delay = *self.0.operation_delay.lock();
        tokio::time::sleep(delay).await;
        self.0.calls.lock().push(format!(
            "shutdown {}/{}/{} {}",
            service_name,
            deployment_name,
            instance_name,
            post_shutdown_action.as_str()
        ));
        self.0
            .set_remote_status(instance_name, post_shutdown_action.as_str());
        Ok(())
    }
}

pub(crate) fn test_publish_settings() -> Arc<PublishSettings> {
    Arc::new(PublishSettings {
        publish_method: "AzureServiceManagementAPI".to_string(),
        management_url: "https://management.core.windows.net".to_string(),
        certificate: ManagementCertificate::placeholder(),
        subscriptions: Vec::new(),
    })
}

pub(crate) fn test_context(fake: &Arc<FakeCompute>) -> Arc<InstanceContext> {
    Arc::new(InstanceContext {
        subscription_id: "sub-1".to_string(),
        publish_settings: test_publish_settings(),
        connector: Arc::new(fake.clone()),
        executor: Arc::new(SerialExecutor::new("test-pool").unwrap()),
        status_wait_timeout: Duration::from_secs(60),
        agent_vm_name_param: "azure.vm.name".to_string(),
    })
}
