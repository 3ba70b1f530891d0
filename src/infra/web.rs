use std::{collections::HashMap, sync::Arc, time::UNIX_EPOCH};

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use log::{info, warn};
use serde::Serialize;

use crate::domain::{
    model::{AgentDescription, CloudInstanceUserData, InstanceStatus},
    CloudClient, CloudImage, CloudInstance,
};

pub fn router(client: Arc<CloudClient>) -> Router {
    Router::new()
        .route("/", get(list_images))
        .route("/error", get(client_error))
        .route("/agents", get(find_instance_by_agent))
        .route("/images/:image_id/instances", post(start_new_instance))
        .route(
            "/images/:image_id/instances/:instance_id/restart",
            post(restart_instance),
        )
        .route(
            "/images/:image_id/instances/:instance_id",
            delete(terminate_instance),
        )
        .with_state(client)
}

#[derive(Serialize)]
struct ImageView {
    id: String,
    name: String,
    instances: Vec<InstanceView>,
}

#[derive(Serialize)]
struct InstanceView {
    id: String,
    image_id: String,
    status: InstanceStatus,
    error: Option<String>,
    started_at: u64,
    network_identity: String,
}

impl From<&CloudInstance> for InstanceView {
    fn from(instance: &CloudInstance) -> Self {
        Self {
            id: instance.id().to_string(),
            image_id: instance.image_id().to_string(),
            status: instance.status(),
            error: instance.error_info().map(|info| info.message),
            started_at: instance
                .started_at()
                .duration_since(UNIX_EPOCH)
                .map(|elapsed| elapsed.as_secs())
                .unwrap_or_default(),
            network_identity: instance.network_identity(),
        }
    }
}

impl From<&CloudImage> for ImageView {
    fn from(image: &CloudImage) -> Self {
        Self {
            id: image.id().to_string(),
            name: image.name().to_string(),
            instances: image
                .instances()
                .iter()
                .map(|instance| InstanceView::from(instance.as_ref()))
                .collect(),
        }
    }
}

type HandlerError = (StatusCode, String);

fn lookup(
    client: &CloudClient,
    image_id: &str,
    instance_id: &str,
) -> Result<Arc<CloudInstance>, HandlerError> {
    client
        .find_image_by_id(image_id)
        .and_then(|image| image.find_instance_by_id(instance_id))
        .ok_or((
            StatusCode::NOT_FOUND,
            format!("No instance {} in image {}", instance_id, image_id),
        ))
}

async fn list_images(State(client): State<Arc<CloudClient>>) -> impl IntoResponse {
    Json(
        client
            .images()
            .iter()
            .map(|image| ImageView::from(image.as_ref()))
            .collect::<Vec<_>>(),
    )
}

async fn client_error(State(client): State<Arc<CloudClient>>) -> impl IntoResponse {
    Json(client.error_info().map(|info| info.message))
}

async fn find_instance_by_agent(
    State(client): State<Arc<CloudClient>>,
    Query(parameters): Query<HashMap<String, String>>,
) -> Result<Json<InstanceView>, HandlerError> {
    client
        .find_instance_by_agent(&AgentDescription::new(parameters))
        .map(|instance| Json(InstanceView::from(instance.as_ref())))
        .ok_or((StatusCode::NOT_FOUND, "No instance matches this agent".to_string()))
}

async fn start_new_instance(
    State(client): State<Arc<CloudClient>>,
    Path(image_id): Path<String>,
    user_data: Option<Json<CloudInstanceUserData>>,
) -> Result<Json<InstanceView>, HandlerError> {
    let image = client
        .find_image_by_id(&image_id)
        .ok_or((StatusCode::NOT_FOUND, format!("No image {}", image_id)))?;
    let user_data = user_data.map(|Json(data)| data).unwrap_or_default();
    client
        .start_new_instance(&image, user_data)
        .map(|instance| Json(InstanceView::from(instance.as_ref())))
        .ok_or_else(|| {
            warn!("Start requested on exhausted image {}", image_id);
            (
                StatusCode::CONFLICT,
                format!("Image {} has no stopped instance left", image_id),
            )
        })
}

async fn restart_instance(
    State(client): State<Arc<CloudClient>>,
    Path((image_id, instance_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, HandlerError> {
    let instance = lookup(&client, &image_id, &instance_id)?;
    info!("Restart of {} requested", instance);
    tokio::spawn(async move { client.restart_instance(&instance).await });
    Ok((StatusCode::ACCEPTED, "Instance restart scheduled"))
}

async fn terminate_instance(
    State(client): State<Arc<CloudClient>>,
    Path((image_id, instance_id)): Path<(String, String)>,
) -> Result<Json<InstanceView>, HandlerError> {
    let instance = lookup(&client, &image_id, &instance_id)?;
    client.terminate_instance(&instance).await;
    Ok(Json(InstanceView::from(instance.as_ref())))
}
