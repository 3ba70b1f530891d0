use std::sync::Arc;

use log::{error, info, warn};
use parking_lot::RwLock;

use super::{
    executor::SerialExecutor,
    image::CloudImage,
    instance::{CloudInstance, InstanceContext},
    model::{AgentDescription, CloudErrorInfo, CloudInstanceUserData},
    port::ComputeConnector,
    publish_settings,
};
use crate::config::CloudClientParameters;

const EXECUTOR_NAME: &str = "azure-cloud-image";

/// Entry point for the embedding system: owns the images and the executor
/// their instances start on.
pub struct CloudClient {
    images: RwLock<Vec<Arc<CloudImage>>>,
    error_info: Option<CloudErrorInfo>,
    executor: Option<Arc<SerialExecutor>>,
    agent_vm_name_param: String,
    agent_image_param: String,
}

impl CloudClient {
    /// A configuration problem never fails construction: the client is
    /// returned without images and with its error set. Being called outside
    /// a Tokio runtime is reported the same way.
    pub fn new(
        parameters: &CloudClientParameters,
        connector: Arc<dyn ComputeConnector + Send + Sync>,
    ) -> Self {
        let initialized = SerialExecutor::new(EXECUTOR_NAME)
            .map(Arc::new)
            .map_err(CloudErrorInfo::from_error)
            .and_then(|executor| {
                let image = build_image(parameters, connector, executor.clone())?;
                Ok((image, executor))
            });
        let (images, executor, error_info) = match initialized {
            Ok((image, executor)) => (vec![Arc::new(image)], Some(executor), None),
            Err(info) => {
                error!("Cloud client configuration error: {}", info);
                (Vec::new(), None, Some(info))
            }
        };
        Self {
            images: RwLock::new(images),
            error_info,
            executor,
            agent_vm_name_param: parameters.agent_vm_name_param.clone(),
            agent_image_param: parameters.agent_image_param.clone(),
        }
    }

    pub fn error_info(&self) -> Option<CloudErrorInfo> {
        self.error_info.clone()
    }

    pub fn is_initialized(&self) -> bool {
        true
    }

    pub fn images(&self) -> Vec<Arc<CloudImage>> {
        self.images.read().clone()
    }

    pub fn find_image_by_id(&self, image_id: &str) -> Option<Arc<CloudImage>> {
        self.images
            .read()
            .iter()
            .find(|image| image.id() == image_id)
            .cloned()
    }

    /// Resolves a worker registration to the instance it runs on. An image
    /// parameter narrows the search to that image; otherwise every image is
    /// searched for the VM name.
    pub fn find_instance_by_agent(&self, agent: &AgentDescription) -> Option<Arc<CloudInstance>> {
        let vm_name = agent.parameter(&self.agent_vm_name_param)?;
        match agent.parameter(&self.agent_image_param) {
            Some(image_id) => self.find_image_by_id(image_id)?.find_instance_by_id(vm_name),
            None => self
                .images()
                .iter()
                .find_map(|image| image.find_instance_by_id(vm_name)),
        }
    }

    pub fn generate_agent_name(&self, agent: &AgentDescription) -> Option<String> {
        self.find_instance_by_agent(agent)
            .map(|instance| instance.name().to_string())
    }

    pub fn can_start_new_instance(&self, image: &CloudImage) -> bool {
        image.has_eligible_instance()
    }

    pub fn start_new_instance(
        &self,
        image: &CloudImage,
        user_data: CloudInstanceUserData,
    ) -> Option<Arc<CloudInstance>> {
        image.start_new_instance(user_data)
    }

    pub async fn restart_instance(&self, instance: &CloudInstance) {
        instance.restart().await
    }

    pub async fn terminate_instance(&self, instance: &CloudInstance) {
        instance.terminate().await
    }

    /// Stops the executor from accepting work, then disposes every image.
    /// Starts still queued find their instance terminated and are skipped.
    pub async fn dispose(&self) {
        if let Some(executor) = &self.executor {
            executor.shutdown();
        }
        let images = std::mem::take(&mut *self.images.write());
        for image in images {
            image.dispose().await;
        }
        info!("Cloud client disposed");
    }
}

fn required<'a>(value: &'a Option<String>, message: &str) -> Result<&'a str, CloudErrorInfo> {
    value
        .as_deref()
        .filter(|value| !value.trim().is_empty())
        .ok_or_else(|| CloudErrorInfo::new(message))
}

/// Blank lines dropped, names trimmed.
pub fn parse_vm_names(vm_names: &str) -> Vec<String> {
    vm_names
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

fn build_image(
    parameters: &CloudClientParameters,
    connector: Arc<dyn ComputeConnector + Send + Sync>,
    executor: Arc<SerialExecutor>,
) -> Result<CloudImage, CloudErrorInfo> {
    let publish_settings_xml = required(&parameters.publish_settings, "No publish settings specified")?;
    let publish_settings = publish_settings::parse(publish_settings_xml).map_err(|e| {
        CloudErrorInfo::new(format!("Error while parsing publish settings: {:#}", e))
    })?;

    let subscription_id = required(&parameters.subscription_id, "No subscription identifier specified")?
        .trim()
        .to_string();
    if !publish_settings.subscriptions.is_empty()
        && !publish_settings
            .subscriptions
            .iter()
            .any(|subscription| subscription.id == subscription_id)
    {
        warn!(
            "Subscription {} is not listed in the publish settings, remote calls may be rejected",
            subscription_id
        );
    }

    let vm_names = parse_vm_names(required(&parameters.vm_names, "No VM names specified")?);
    if vm_names.is_empty() {
        return Err(CloudErrorInfo::new("No VM names specified"));
    }

    let context = Arc::new(InstanceContext {
        subscription_id,
        publish_settings: Arc::new(publish_settings),
        connector,
        executor,
        status_wait_timeout: parameters.status_wait_timeout(),
        agent_vm_name_param: parameters.agent_vm_name_param.clone(),
    });
    Ok(CloudImage::new(parameters.image_name.clone(), &vm_names, context))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::fake::FakeCompute;

    #[test]
    fn outside_a_runtime_the_client_reports_an_error() {
        let client = CloudClient::new(
            &CloudClientParameters::default(),
            Arc::new(FakeCompute::with_vms(&[])),
        );

        let error = client.error_info().unwrap();
        assert!(error.message.contains("within a Tokio runtime"), "{}", error.message);
        assert!(client.images().is_empty());
    }

    #[tokio::test]
    async fn whitespace_only_vm_names_are_a_configuration_error() {
        let certificate = include_str!("../../tests/fixtures/management_certificate.txt");
        let parameters = CloudClientParameters {
            publish_settings: Some(format!(
                r#"<PublishData><PublishProfile Url="https://management.core.windows.net" ManagementCertificate="{}" /></PublishData>"#,
                certificate.trim()
            )),
            subscription_id: Some("sub-1".to_string()),
            vm_names: Some(" \n \n".to_string()),
            ..Default::default()
        };
        let client = CloudClient::new(&parameters, Arc::new(FakeCompute::with_vms(&[])));

        assert_eq!(client.error_info().unwrap().message, "No VM names specified");
        assert!(client.images().is_empty());
    }

    #[test]
    fn vm_names_drop_blank_lines_and_whitespace() {
        assert_eq!(
            parse_vm_names("vm-a\nvm-b\n\n  vm-c  "),
            vec!["vm-a", "vm-b", "vm-c"]
        );
        assert_eq!(parse_vm_names("vm-a\r\n\t\r\nvm-b\r\n"), vec!["vm-a", "vm-b"]);
        assert!(parse_vm_names(" \n \n").is_empty());
    }

    #[test]
    fn required_rejects_blank_values() {
        assert!(required(&None, "missing").is_err());
        assert_eq!(required(&Some("  ".to_string()), "missing").unwrap_err().message, "missing");
        assert_eq!(required(&Some("sub".to_string()), "missing").unwrap(), "sub");
    }
}
