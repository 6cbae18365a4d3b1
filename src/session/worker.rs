use std::sync::Arc;

use log::debug;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};

use crate::ble::transport::GattTransport;
use crate::ble::BleError;

type Job = Box<dyn FnOnce(&dyn GattTransport) + Send>;

/// Runs every state-mutating transport call on one task, in submission order.
pub(crate) struct TransportWorker {
    jobs: mpsc::UnboundedSender<Job>,
}

impl TransportWorker {
    pub fn spawn(runtime: &Handle, tag: String, transport: Arc<dyn GattTransport>) -> Self {
        let (jobs, mut rx) = mpsc::unbounded_channel::<Job>();
        runtime.spawn(async move {
            while let Some(job) = rx.recv().await {
                job(transport.as_ref());
            }
            debug!("{} transport worker stopped", tag);
        });
        Self { jobs }
    }

    /// Run `call` against the transport and wait for its return value.
    pub async fn call<R, F>(&self, call: F) -> Result<R, BleError>
    where
        F: FnOnce(&dyn GattTransport) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job: Job = Box::new(move |transport| {
            let _ = tx.send(call(transport));
        });
        self.jobs
            .send(job)
            .map_err(|_| BleError::TransportClosed)?;
        rx.await.map_err(|_| BleError::TransportClosed)
    }
}
