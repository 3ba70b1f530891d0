use std::sync::Arc;

use dashmap::{mapref::entry::Entry, DashMap};
use log::{info, warn};
use parking_lot::Mutex;

use super::{
    instance::{CloudInstance, InstanceContext},
    model::{CloudErrorInfo, CloudInstanceUserData, InstanceStatus},
};

/// Named, fixed pool of instances sharing one subscription and credential.
pub struct CloudImage {
    id: String,
    name: String,
    instances: DashMap<String, Arc<CloudInstance>>,
    selection: Mutex<()>,
}

impl CloudImage {
    pub fn new(id: impl Into<String>, vm_names: &[String], context: Arc<InstanceContext>) -> Self {
        let id = id.into();
        let instances = DashMap::new();
        for vm_name in vm_names {
            match instances.entry(vm_name.clone()) {
                Entry::Occupied(_) => {
                    warn!("VM {} is listed more than once for image {}, keeping one instance", vm_name, id)
                }
                Entry::Vacant(entry) => {
                    entry.insert(Arc::new(CloudInstance::new(vm_name.clone(), id.clone(), context.clone())));
                }
            }
        }
        info!("Image {} created with {} instances", id, instances.len());
        Self {
            name: id.clone(),
            id,
            instances,
            selection: Mutex::new(()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_reusable(&self) -> bool {
        true
    }

    pub fn error_info(&self) -> Option<CloudErrorInfo> {
        None
    }

    /// Snapshot of the instances, ordered by name.
    pub fn instances(&self) -> Vec<Arc<CloudInstance>> {
        let mut instances: Vec<Arc<CloudInstance>> = self
            .instances
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        instances.sort_by(|a, b| a.id().cmp(b.id()));
        instances
    }

    pub fn find_instance_by_id(&self, instance_id: &str) -> Option<Arc<CloudInstance>> {
        self.instances.get(instance_id).map(|entry| entry.value().clone())
    }

    pub fn has_eligible_instance(&self) -> bool {
        self.instances.iter().any(|entry| is_eligible(entry.value()))
    }

    /// Starts the first stopped, error-free instance. `None` when the pool is exhausted.
    pub fn start_new_instance(&self, user_data: CloudInstanceUserData) -> Option<Arc<CloudInstance>> {
        let _selection = self.selection.lock();
        let candidate = self
            .instances
            .iter()
            .find(|entry| is_eligible(entry.value()))
            .map(|entry| entry.value().clone());
        match candidate {
            Some(instance) => {
                info!("Image {} assigns instance {}", self.id, instance.id());
                instance.start(user_data);
                Some(instance)
            }
            None => {
                warn!("Image {} has no stopped instance left to start", self.id);
                None
            }
        }
    }

    /// Terminates every instance, then empties the pool.
    pub async fn dispose(&self) {
        for instance in self.instances() {
            instance.terminate().await;
        }
        self.instances.clear();
        info!("Image {} disposed", self.id);
    }
}

fn is_eligible(instance: &CloudInstance) -> bool {
    instance.error_info().is_none()
        && instance.status() == InstanceStatus::Stopped
        && instance.is_restartable()
}
