use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, SystemTime},
};

use anyhow::{Context, Error};
use log::{debug, error, info, warn};
use tokio::sync::watch;

use super::{
    executor::SerialExecutor,
    model::{AgentDescription, CloudErrorInfo, CloudInstanceUserData, InstanceStatus, PostShutdownAction},
    port::ComputeConnector,
    publish_settings::PublishSettings,
};

/// Everything an instance needs to reach its remote VM, shared by all instances of an image.
#[derive(Clone)]
pub struct InstanceContext {
    pub subscription_id: String,
    pub publish_settings: Arc<PublishSettings>,
    pub connector: Arc<dyn ComputeConnector + Send + Sync>,
    pub executor: Arc<SerialExecutor>,
    pub status_wait_timeout: Duration,
    pub agent_vm_name_param: String,
}

#[derive(Clone, Debug)]
struct InstanceState {
    status: InstanceStatus,
    error_info: Option<CloudErrorInfo>,
}

#[derive(Clone, Copy, Debug)]
enum RemoteTarget {
    Running,
    Stopped,
}

/// One pre-provisioned VM slot.
///
/// Status and error are published through a watch channel so every
/// transition is visible to readers and waiters as soon as it happens.
pub struct CloudInstance {
    id: String,
    image_id: String,
    started_at: SystemTime,
    context: Arc<InstanceContext>,
    state: watch::Sender<InstanceState>,
    // Bumped by every start, restart and terminate; a queued start only runs if still current.
    attempt: AtomicU64,
}

impl fmt::Debug for CloudInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("CloudInstance")
            .field("id", &self.id)
            .field("image_id", &self.image_id)
            .field("status", &state.status)
            .field("error_info", &state.error_info)
            .finish()
    }
}

impl fmt::Display for CloudInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.id, self.image_id)
    }
}

impl CloudInstance {
    pub fn new(id: impl Into<String>, image_id: impl Into<String>, context: Arc<InstanceContext>) -> Self {
        let (state, _) = watch::channel(InstanceState {
            status: InstanceStatus::Stopped,
            error_info: None,
        });
        Self {
            id: id.into(),
            image_id: image_id.into(),
            started_at: SystemTime::now(),
            context,
            state,
            attempt: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.id
    }

    pub fn image_id(&self) -> &str {
        &self.image_id
    }

    /// Time the slot became known, not the last remote start.
    pub fn started_at(&self) -> SystemTime {
        self.started_at
    }

    pub fn network_identity(&self) -> String {
        format!("cloud.azure.{}", self.image_id)
    }

    pub fn is_restartable(&self) -> bool {
        true
    }

    pub fn status(&self) -> InstanceStatus {
        self.state.borrow().status
    }

    pub fn error_info(&self) -> Option<CloudErrorInfo> {
        self.state.borrow().error_info.clone()
    }

    pub fn contains_agent(&self, agent: &AgentDescription) -> bool {
        agent.parameter(&self.context.agent_vm_name_param) == Some(self.id.as_str())
    }

    /// Marks the instance STARTING and queues the remote start on the shared executor.
    pub fn start(self: &Arc<Self>, user_data: CloudInstanceUserData) {
        let attempt = self.begin_attempt(InstanceStatus::Starting);
        debug!("Start of {} requested with {:?}", self, user_data);

        let instance = Arc::clone(self);
        let submitted = self.context.executor.submit(
            format!("Start cloud instance {}", self),
            async move {
                if instance.attempt.load(Ordering::SeqCst) != attempt {
                    debug!("Queued start of {} superseded, skipped", instance);
                    return;
                }
                if let Err(e) = instance.do_start().await {
                    instance.process_error(e);
                }
            },
        );
        if let Err(e) = submitted {
            self.process_error(e);
        }
    }

    /// Waits for RUNNING, then stops and starts the VM on the caller's task.
    pub async fn restart(&self) {
        self.wait_for_status(InstanceStatus::Running).await;
        self.begin_attempt(InstanceStatus::Restarting);
        let result: Result<(), Error> = async {
            self.do_stop().await?;
            self.wait_for_status(InstanceStatus::Stopped).await;
            self.do_start().await
        }
        .await;
        if let Err(e) = result {
            self.process_error(e);
        }
    }

    pub async fn terminate(&self) {
        self.next_attempt();
        self.clear_error();
        if let Err(e) = self.do_stop().await {
            self.process_error(e);
        }
        self.cleanup_stopped_instance();
    }

    /// Resolves once the status equals `status` or the configured ceiling elapses.
    /// Returns whether the status was reached.
    pub async fn wait_for_status(&self, status: InstanceStatus) -> bool {
        let mut receiver = self.state.subscribe();
        let reached = tokio::time::timeout(
            self.context.status_wait_timeout,
            receiver.wait_for(|state| state.status == status),
        )
        .await
        .map(|result| result.is_ok())
        .unwrap_or(false);
        if !reached {
            warn!(
                "Instance {} did not reach {} within {:?}, current status {}",
                self,
                status,
                self.context.status_wait_timeout,
                self.status()
            );
        }
        reached
    }

    fn cleanup_stopped_instance(&self) {
        debug!("Cleanup after stop of {}", self);
    }

    async fn do_start(&self) -> Result<(), Error> {
        self.set_status(InstanceStatus::Starting);
        self.drive_remote(RemoteTarget::Running).await?;
        self.set_status(InstanceStatus::Running);
        Ok(())
    }

    async fn do_stop(&self) -> Result<(), Error> {
        self.set_status(InstanceStatus::Stopping);
        self.drive_remote(RemoteTarget::Stopped).await?;
        self.set_status(InstanceStatus::Stopped);
        Ok(())
    }

    /// Walks services, deployments and persistent VM roles, and issues the
    /// start or deallocating shutdown for every role instance named like this
    /// instance that is not already in the target state. No match is not an error.
    async fn drive_remote(&self, target: RemoteTarget) -> Result<(), Error> {
        let context = &self.context;
        let management = context
            .connector
            .connect(&context.subscription_id, &context.publish_settings)
            .await
            .with_context(|| {
                format!(
                    "Can't open compute management session for subscription {}",
                    context.subscription_id
                )
            })?;

        let mut matched = false;
        let services = management
            .list_hosted_services()
            .await
            .context("Can't list hosted services")?;
        for service in services {
            let deployments = management
                .get_deployments(&service.service_name)
                .await
                .with_context(|| format!("Can't get deployments of hosted service {}", service.service_name))?;
            for deployment in &deployments {
                for role_instance in deployment.persistent_vm_instances() {
                    if !role_instance.matches_name(&self.id) {
                        continue;
                    }
                    matched = true;
                    match target {
                        RemoteTarget::Running if !role_instance.is_ready() => {
                            info!(
                                "Starting VM {} in {}/{} (remote status {})",
                                role_instance.instance_name,
                                service.service_name,
                                deployment.name,
                                role_instance.instance_status
                            );
                            management
                                .start_role_instance(
                                    &service.service_name,
                                    &deployment.name,
                                    &role_instance.instance_name,
                                )
                                .await
                                .with_context(|| format!("Can't start VM {}", role_instance.instance_name))?;
                        }
                        RemoteTarget::Stopped if !role_instance.is_stopped() => {
                            info!(
                                "Stopping VM {} in {}/{} (remote status {})",
                                role_instance.instance_name,
                                service.service_name,
                                deployment.name,
                                role_instance.instance_status
                            );
                            management
                                .shutdown_role_instance(
                                    &service.service_name,
                                    &deployment.name,
                                    &role_instance.instance_name,
                                    PostShutdownAction::StoppedDeallocated,
                                )
                                .await
                                .with_context(|| format!("Can't stop VM {}", role_instance.instance_name))?;
                        }
                        _ => debug!(
                            "VM {} already {}, nothing to do",
                            role_instance.instance_name, role_instance.instance_status
                        ),
                    }
                }
            }
        }
        if !matched {
            warn!("No remote VM matches instance {}, nothing to do for {:?}", self, target);
        }
        Ok(())
    }

    fn set_status(&self, status: InstanceStatus) {
        let mut previous = status;
        self.state.send_modify(|state| {
            previous = state.status;
            state.status = status;
        });
        if previous != status {
            info!("Instance {} : {} -> {}", self, previous, status);
        }
    }

    fn next_attempt(&self) -> u64 {
        self.attempt.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn begin_attempt(&self, status: InstanceStatus) -> u64 {
        let attempt = self.next_attempt();
        self.clear_error();
        self.set_status(status);
        attempt
    }

    fn clear_error(&self) {
        self.state.send_if_modified(|state| state.error_info.take().is_some());
    }

    fn process_error(&self, error: Error) {
        error!("Operation on instance {} failed: {:?}", self, error);
        let info = CloudErrorInfo::from_error(error);
        self.state.send_modify(|state| {
            state.error_info = Some(info);
            state.status = InstanceStatus::Error;
        });
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use map_macro::hash_map;

    use super::*;
    use crate::domain::fake::{test_context, FakeCompute};

    fn instance(fake: &Arc<FakeCompute>, name: &str) -> Arc<CloudInstance> {
        Arc::new(CloudInstance::new(name, "Azure VMs", test_context(fake)))
    }

    #[tokio::test]
    async fn start_reaches_running_and_starts_remote_vm() {
        let fake = FakeCompute::with_vms(&[("vm-a", "StoppedDeallocated")]);
        let vm = instance(&fake, "vm-a");

        vm.start(CloudInstanceUserData::default());
        assert_eq!(vm.status(), InstanceStatus::Starting);

        assert!(vm.wait_for_status(InstanceStatus::Running).await);
        assert!(vm.error_info().is_none());
        assert_eq!(fake.calls(), vec!["start svc/prod/vm-a"]);
    }

    #[tokio::test]
    async fn start_skips_vm_already_ready() {
        let fake = FakeCompute::with_vms(&[("VM-A", "ReadyRole")]);
        let vm = instance(&fake, "vm-a");

        vm.start(CloudInstanceUserData::default());

        assert!(vm.wait_for_status(InstanceStatus::Running).await);
        assert!(fake.calls().is_empty());
    }

    #[tokio::test]
    async fn unknown_vm_is_a_silent_no_op() {
        let fake = FakeCompute::with_vms(&[("other", "StoppedVM")]);
        let vm = instance(&fake, "vm-a");

        vm.start(CloudInstanceUserData::default());

        assert!(vm.wait_for_status(InstanceStatus::Running).await);
        assert!(vm.error_info().is_none());
        assert!(fake.calls().is_empty());
    }

    #[tokio::test]
    async fn remote_failure_is_captured_as_error() {
        let fake = FakeCompute::with_vms(&[("vm-a", "StoppedVM")]);
        fake.fail_connect("certificate rejected");
        let vm = instance(&fake, "vm-a");

        vm.start(CloudInstanceUserData::default());

        assert!(vm.wait_for_status(InstanceStatus::Error).await);
        let info = vm.error_info().unwrap();
        assert!(info.message.contains("Can't open compute management session"));
        assert!(format!("{:?}", info.cause.unwrap()).contains("certificate rejected"));
    }

    #[tokio::test]
    async fn terminate_stops_with_deallocation() {
        let fake = FakeCompute::with_vms(&[("vm-a", "ReadyRole")]);
        let vm = instance(&fake, "vm-a");

        vm.terminate().await;

        assert_eq!(vm.status(), InstanceStatus::Stopped);
        assert_eq!(fake.calls(), vec!["shutdown svc/prod/vm-a StoppedDeallocated"]);
    }

    #[tokio::test]
    async fn terminate_failure_ends_in_error_and_new_attempt_clears_it() {
        let fake = FakeCompute::with_vms(&[("vm-a", "ReadyRole")]);
        fake.fail_connect("unauthorized");
        let vm = instance(&fake, "vm-a");

        vm.terminate().await;
        assert_eq!(vm.status(), InstanceStatus::Error);
        assert!(vm.error_info().is_some());

        fake.recover();
        vm.terminate().await;
        assert_eq!(vm.status(), InstanceStatus::Stopped);
        assert!(vm.error_info().is_none());
    }

    #[tokio::test]
    async fn restart_cycles_running_instance() {
        let fake = FakeCompute::with_vms(&[("vm-a", "StoppedVM")]);
        let vm = instance(&fake, "vm-a");
        vm.start(CloudInstanceUserData::default());

        vm.restart().await;

        assert_eq!(vm.status(), InstanceStatus::Running);
        assert_eq!(
            fake.calls(),
            vec![
                "start svc/prod/vm-a",
                "shutdown svc/prod/vm-a StoppedDeallocated",
                "start svc/prod/vm-a",
            ]
        );
    }

    #[tokio::test]
    async fn restart_failure_leaves_error_instead_of_cycling() {
        let fake = FakeCompute::with_vms(&[("vm-a", "StoppedVM")]);
        let vm = instance(&fake, "vm-a");
        vm.start(CloudInstanceUserData::default());
        assert!(vm.wait_for_status(InstanceStatus::Running).await);

        fake.fail_connect("boom");
        vm.restart().await;

        assert_eq!(vm.status(), InstanceStatus::Error);
        let info = vm.error_info().unwrap();
        assert!(info.message.contains("Can't open compute management session for subscription sub-1"));
        assert_eq!(fake.calls(), vec!["start svc/prod/vm-a"]);
    }

    #[tokio::test]
    async fn successful_start_clears_previous_error() {
        let fake = FakeCompute::with_vms(&[("vm-a", "StoppedVM")]);
        fake.fail_connect("unauthorized");
        let vm = instance(&fake, "vm-a");
        vm.start(CloudInstanceUserData::default());
        assert!(vm.wait_for_status(InstanceStatus::Error).await);

        fake.recover();
        vm.start(CloudInstanceUserData::default());
        assert!(vm.error_info().is_none());

        assert!(vm.wait_for_status(InstanceStatus::Running).await);
        assert!(vm.error_info().is_none());
    }

    #[tokio::test]
    async fn queued_start_is_skipped_once_instance_terminated() {
        let fake = FakeCompute::with_vms(&[("vm-a", "StoppedVM"), ("vm-b", "StoppedVM")]);
        fake.delay_operations(Duration::from_millis(50));
        let context = test_context(&fake);
        let vm_a = Arc::new(CloudInstance::new("vm-a", "Azure VMs", context.clone()));
        let vm_b = Arc::new(CloudInstance::new("vm-b", "Azure VMs", context.clone()));

        vm_a.start(CloudInstanceUserData::default());
        vm_b.start(CloudInstanceUserData::default());
        vm_b.terminate().await;
        assert_eq!(vm_b.status(), InstanceStatus::Stopped);

        context.executor.join().await;

        assert_eq!(vm_a.status(), InstanceStatus::Running);
        assert_eq!(vm_b.status(), InstanceStatus::Stopped);
        assert_eq!(fake.calls(), vec!["start svc/prod/vm-a"]);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_status_gives_up_after_ceiling() {
        let fake = FakeCompute::with_vms(&[]);
        let vm = instance(&fake, "vm-a");

        let started = tokio::time::Instant::now();
        assert!(!vm.wait_for_status(InstanceStatus::Running).await);
        assert!(started.elapsed() >= Duration::from_secs(60));
    }

    #[tokio::test]
    async fn start_after_executor_shutdown_is_recorded() {
        let fake = FakeCompute::with_vms(&[("vm-a", "StoppedVM")]);
        let vm = instance(&fake, "vm-a");
        vm.context.executor.shutdown();

        vm.start(CloudInstanceUserData::default());

        assert_eq!(vm.status(), InstanceStatus::Error);
        assert!(vm.error_info().unwrap().message.contains("shut down"));
    }

    #[tokio::test]
    async fn contains_agent_matches_vm_name_parameter() {
        let fake = FakeCompute::with_vms(&[]);
        let vm = instance(&fake, "vm-a");

        assert!(vm.contains_agent(&AgentDescription::new(hash_map! {
            "azure.vm.name".to_string() => "vm-a".to_string()
        })));
        assert!(!vm.contains_agent(&AgentDescription::new(hash_map! {
            "azure.vm.name".to_string() => "vm-b".to_string()
        })));
        assert!(!vm.contains_agent(&AgentDescription::default()));
        assert_eq!(vm.network_identity(), "cloud.azure.Azure VMs");
    }
}
