use std::time::Duration;

use anyhow::{anyhow, Context, Error};
use async_trait::async_trait;
use log::{debug, info};
use reqwest::{header::CONTENT_TYPE, Client, Method, RequestBuilder, Response, StatusCode};
use serde::{de::DeserializeOwned, Deserialize};
use uuid::Uuid;

use crate::domain::{
    model::{Deployment, HostedService, PostShutdownAction, Role, RoleInstance},
    port::{ComputeConnector, ComputeManagement},
    publish_settings::PublishSettings,
};

const API_VERSION: &str = "2014-06-01";
const AZURE_NAMESPACE: &str = "http://schemas.microsoft.com/windowsazure";
const XSI_NAMESPACE: &str = "http://www.w3.org/2001/XMLSchema-instance";

/// Service Management REST API, authenticated with the management certificate.
pub struct AzureComputeConnector {
    pub operation_poll_interval: Duration,
    pub request_timeout: Duration,
}

impl AzureComputeConnector {
    pub fn new(operation_poll_interval: Duration) -> Self {
        Self {
            operation_poll_interval,
            request_timeout: Duration::from_secs(120),
        }
    }
}

#[async_trait]
impl ComputeConnector for AzureComputeConnector {
    async fn connect(
        &self,
        subscription_id: &str,
        publish_settings: &PublishSettings,
    ) -> Result<Box<dyn ComputeManagement + Send + Sync>, Error> {
        let pem = publish_settings.certificate.to_pem();
        let identity = reqwest::Identity::from_pem(pem.as_bytes())
            .context("Can't build client identity from management certificate")?;
        let http = Client::builder()
            .identity(identity)
            .timeout(self.request_timeout)
            .build()
            .context("Can't build HTTP client for compute management")?;
        debug!(
            "Opened compute management session on {} for subscription {}",
            publish_settings.management_url, subscription_id
        );
        Ok(Box::new(AzureComputeManagement {
            http,
            base_url: format!("{}/{}", publish_settings.management_url, subscription_id),
            operation_poll_interval: self.operation_poll_interval,
        }))
    }
}

struct AzureComputeManagement {
    http: Client,
    base_url: String,
    operation_poll_interval: Duration,
}

#[async_trait]
impl ComputeManagement for AzureComputeManagement {
    async fn list_hosted_services(&self) -> Result<Vec<HostedService>, Error> {
        let body = self.get("/services/hostedservices").await?;
        parse_hosted_services(&body)
    }

    async fn get_deployments(&self, service_name: &str) -> Result<Vec<Deployment>, Error> {
        let body = self
            .get(&format!("/services/hostedservices/{}?embed-detail=true", service_name))
            .await?;
        parse_deployments(&body)
    }

    async fn start_role_instance(
        &self,
        service_name: &str,
        deployment_name: &str,
        instance_name: &str,
    ) -> Result<(), Error> {
        self.post_role_operation(service_name, deployment_name, instance_name, start_role_body())
            .await
    }

    async fn shutdown_role_instance(
        &self,
        service_name: &str,
        deployment_name: &str,
        instance_name: &str,
        post_shutdown_action: PostShutdownAction,
    ) -> Result<(), Error> {
        self.post_role_operation(
            service_name,
            deployment_name,
            instance_name,
            shutdown_role_body(post_shutdown_action),
        )
        .await
    }
}

impl AzureComputeManagement {
    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http
            .request(method, format!("{}{}", self.base_url, path))
            .header("x-ms-version", API_VERSION)
            .header("x-ms-client-request-id", Uuid::new_v4().to_string())
    }

    async fn get(&self, path: &str) -> Result<String, Error> {
        debug!("GET {}{}", self.base_url, path);
        let response = self
            .request(Method::GET, path)
            .send()
            .await
            .with_context(|| format!("Request GET {} failed", path))?;
        ensure_success(response)
            .await?
            .text()
            .await
            .with_context(|| format!("Can't read response of GET {}", path))
    }

    async fn post_role_operation(
        &self,
        service_name: &str,
        deployment_name: &str,
        instance_name: &str,
        body: String,
    ) -> Result<(), Error> {
        let path = format!(
            "/services/hostedservices/{}/deployments/{}/roleinstances/{}/Operations",
            service_name, deployment_name, instance_name
        );
        debug!("POST {}{}", self.base_url, path);
        let response = self
            .request(Method::POST, &path)
            .header(CONTENT_TYPE, "application/xml")
            .body(body)
            .send()
            .await
            .with_context(|| format!("Request POST {} failed", path))?;
        let response = ensure_success(response).await?;
        let request_id = response
            .headers()
            .get("x-ms-request-id")
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        match (response.status(), request_id) {
            (StatusCode::ACCEPTED, Some(request_id)) => self.wait_for_operation(&request_id).await,
            _ => Ok(()),
        }
    }

    async fn wait_for_operation(&self, request_id: &str) -> Result<(), Error> {
        loop {
            let body = self.get(&format!("/operations/{}", request_id)).await?;
            let operation: OperationXml = from_xml(&body)?;
            match operation.status.as_str() {
                "InProgress" => {
                    debug!("Operation {} in progress", request_id);
                    tokio::time::sleep(self.operation_poll_interval).await;
                }
                "Succeeded" => {
                    info!("Operation {} succeeded", request_id);
                    return Ok(());
                }
                status => {
                    let detail = operation
                        .error
                        .map(|error| format!("{}: {}", error.code, error.message))
                        .unwrap_or_default();
                    return Err(anyhow!("Operation {} ended with status {} {}", request_id, status, detail));
                }
            }
        }
    }
}

async fn ensure_success(response: Response) -> Result<Response, Error> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let url = response.url().to_string();
    let body = response.text().await.unwrap_or_default();
    let detail = from_xml::<ErrorXml>(&body)
        .map(|error| format!("{}: {}", error.code, error.message))
        .unwrap_or(body);
    Err(anyhow!("Compute management call {} answered {} - {}", url, status, detail))
}

fn from_xml<T: DeserializeOwned>(body: &str) -> Result<T, Error> {
    quick_xml::de::from_str(body).context("Unexpected compute management response")
}

fn start_role_body() -> String {
    format!(
        r#"<StartRoleOperation xmlns="{}" xmlns:i="{}"><OperationType>StartRoleOperation</OperationType></StartRoleOperation>"#,
        AZURE_NAMESPACE, XSI_NAMESPACE
    )
}

fn shutdown_role_body(post_shutdown_action: PostShutdownAction) -> String {
    format!(
        r#"<ShutdownRoleOperation xmlns="{}" xmlns:i="{}"><OperationType>ShutdownRoleOperation</OperationType><PostShutdownAction>{}</PostShutdownAction></ShutdownRoleOperation>"#,
        AZURE_NAMESPACE,
        XSI_NAMESPACE,
        post_shutdown_action.as_str()
    )
}

#[derive(Deserialize)]
struct HostedServicesXml {
    #[serde(rename = "HostedService", default)]
    services: Vec<HostedServiceXml>,
}

#[derive(Deserialize)]
struct HostedServiceXml {
    #[serde(rename = "ServiceName")]
    service_name: String,
}

#[derive(Deserialize)]
struct HostedServiceDetailXml {
    #[serde(rename = "Deployments", default)]
    deployments: DeploymentsXml,
}

#[derive(Deserialize, Default)]
struct DeploymentsXml {
    #[serde(rename = "Deployment", default)]
    items: Vec<DeploymentXml>,
}

#[derive(Deserialize)]
struct DeploymentXml {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "RoleInstanceList", default)]
    role_instances: RoleInstanceListXml,
    #[serde(rename = "RoleList", default)]
    roles: RoleListXml,
}

#[derive(Deserialize, Default)]
struct RoleInstanceListXml {
    #[serde(rename = "RoleInstance", default)]
    items: Vec<RoleInstanceXml>,
}

#[derive(Deserialize)]
struct RoleInstanceXml {
    #[serde(rename = "RoleName")]
    role_name: String,
    #[serde(rename = "InstanceName")]
    instance_name: String,
    #[serde(rename = "InstanceStatus", default)]
    instance_status: String,
}

#[derive(Deserialize, Default)]
struct RoleListXml {
    #[serde(rename = "Role", default)]
    items: Vec<RoleXml>,
}

#[derive(Deserialize)]
struct RoleXml {
    #[serde(rename = "RoleName")]
    role_name: String,
    #[serde(rename = "RoleType", default)]
    role_type: String,
}

#[derive(Deserialize)]
struct OperationXml {
    #[serde(rename = "Status")]
    status: String,
    #[serde(rename = "Error")]
    error: Option<ErrorXml>,
}

#[derive(Deserialize)]
struct ErrorXml {
    #[serde(rename = "Code", default)]
    code: String,
    #[serde(rename = "Message", default)]
    message: String,
}

fn parse_hosted_services(body: &str) -> Result<Vec<HostedService>, Error> {
    let services: HostedServicesXml = from_xml(body)?;
    Ok(services
        .services
        .into_iter()
        .map(|service| HostedService {
            service_name: service.service_name,
        })
        .collect())
}

fn parse_deployments(body: &str) -> Result<Vec<Deployment>, Error> {
    let detail: HostedServiceDetailXml = from_xml(body)?;
    Ok(detail
        .deployments
        .items
        .into_iter()
        .map(|deployment| Deployment {
            name: deployment.name,
            roles: deployment
                .roles
                .items
                .into_iter()
                .map(|role| Role {
                    role_name: role.role_name,
                    role_type: role.role_type,
                })
                .collect(),
            role_instances: deployment
                .role_instances
                .items
                .into_iter()
                .map(|instance| RoleInstance {
                    role_name: instance.role_name,
                    instance_name: instance.instance_name,
                    instance_status: instance.instance_status,
                })
                .collect(),
        })
        .collect())
}
