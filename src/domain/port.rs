use anyhow::Error;
use async_trait::async_trait;

use super::{
    model::{Deployment, HostedService, PostShutdownAction},
    publish_settings::PublishSettings,
};

/// Opens authenticated sessions against the compute management endpoint.
#[async_trait]
pub trait ComputeConnector {
    async fn connect(
        &self,
        subscription_id: &str,
        publish_settings: &PublishSettings,
    ) -> Result<Box<dyn ComputeManagement + Send + Sync>, Error>;
}

/// Remote operations return once the provider reports completion.
#[async_trait]
pub trait ComputeManagement {
    async fn list_hosted_services(&self) -> Result<Vec<HostedService>, Error>;

    async fn get_deployments(&self, service_name: &str) -> Result<Vec<Deployment>, Error>;

    async fn start_role_instance(
        &self,
        service_name: &str,
        deployment_name: &str,
        instance_name: &str,
    ) -> Result<(), Error>;

    async fn shutdown_role_instance(
        &self,
        service_name: &str,
        deployment_name: &str,
        instance_name: &str,
        post_shutdown_action: PostShutdownAction,
    ) -> Result<(), Error>;
}
