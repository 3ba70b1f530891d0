use std::{future::Future, panic::AssertUnwindSafe};

use anyhow::{anyhow, Context, Error};
use futures::{future::BoxFuture, FutureExt};
use log::{debug, error};
use parking_lot::Mutex;
use tokio::{runtime::Handle, sync::mpsc, task::JoinHandle};

struct Task {
    description: String,
    future: BoxFuture<'static, ()>,
}

/// Background facility running submitted tasks one at a time, in submission order.
///
/// The worker runs on the Tokio runtime current at creation. After
/// [`SerialExecutor::shutdown`] already queued tasks still run and new
/// submissions are rejected.
pub struct SerialExecutor {
    name: String,
    sender: Mutex<Option<mpsc::UnboundedSender<Task>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SerialExecutor {
    pub fn new(name: impl Into<String>) -> Result<Self, Error> {
        let name = name.into();
        let runtime = Handle::try_current()
            .with_context(|| format!("Executor {} must be created within a Tokio runtime", name))?;
        let (sender, mut receiver) = mpsc::unbounded_channel::<Task>();
        let worker_name = name.clone();
        let worker = runtime.spawn(async move {
            while let Some(task) = receiver.recv().await {
                debug!("[{}] Running task: {}", worker_name, task.description);
                if AssertUnwindSafe(task.future).catch_unwind().await.is_err() {
                    error!("[{}] Task panicked: {}", worker_name, task.description);
                }
            }
            debug!("[{}] Worker stopped", worker_name);
        });
        Ok(Self {
            name,
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn submit<F>(&self, description: impl Into<String>, task: F) -> Result<(), Error>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let description = description.into();
        let sender = self.sender.lock();
        let sender = sender
            .as_ref()
            .ok_or(anyhow!("Executor {} is shut down, rejected task: {}", self.name, description))?;
        sender
            .send(Task {
                description,
                future: task.boxed(),
            })
            .map_err(|rejected| {
                anyhow!(
                    "Executor {} worker is gone, rejected task: {}",
                    self.name,
                    rejected.0.description
                )
            })
    }

    pub fn shutdown(&self) {
        if self.sender.lock().take().is_some() {
            debug!("[{}] Shutdown requested", self.name);
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.sender.lock().is_none()
    }

    /// Shuts down and waits for the queued tasks to drain.
    pub async fn join(&self) {
        self.shutdown();
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                error!("[{}] Worker terminated abnormally: {:?}", self.name, e);
            }
        }
    }
}
