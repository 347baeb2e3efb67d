//! Worker runtime: drives a user callback for every job received on a
//! Listen stream and forwards its progress as heartbeats.
//!
//! The callback gets a private state channel; every value pushed to it is
//! sent upstream as a non-terminal heartbeat. A successful callback is
//! finalized with `finished = true`; a failed one is not, so the heartbeat
//! deadline reclaims the job for another attempt.

use std::future::Future;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;

use crate::error::{BackplaneError, Result};
use crate::proto::jobs_client::JobsClient;
use crate::proto::{HeartbeatRequest, ListenRequest};

/// Error type produced by job callbacks.
pub type CallbackError = Box<dyn std::error::Error + Send + Sync>;

pub struct Worker<F> {
    client: JobsClient<Channel>,
    queue: String,
    callback: F,
}

impl<F, Fut> Worker<F>
where
    F: Fn(CancellationToken, Vec<u8>, mpsc::Sender<Vec<u8>>) -> Fut,
    Fut: Future<Output = std::result::Result<(), CallbackError>> + Send + 'static,
{
    pub fn new(client: JobsClient<Channel>, queue: impl Into<String>, callback: F) -> Self {
        Self {
            client,
            queue: queue.into(),
            callback,
        }
    }

    /// Process jobs until `cancel` fires. The Listen stream is re-opened
    /// after every error: at-least-once processing with transport
    /// resilience.
    pub async fn work(&self, cancel: CancellationToken) -> Result<()> {
        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }
            match self.run_stream(&cancel).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    tracing::error!(queue = %self.queue, error = %err, "worker stream failed, reconnecting");
                }
            }
        }
    }

    async fn run_stream(&self, cancel: &CancellationToken) -> Result<()> {
        let mut client = self.client.clone();
        let mut stream = client
            .listen(ListenRequest {
                queue: self.queue.clone(),
            })
            .await?
            .into_inner();

        loop {
            let message = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                message = stream.message() => message?,
            };
            let Some(job) = message else {
                return Err(BackplaneError::Unavailable(
                    "listen stream ended".to_string(),
                ));
            };
            tracing::info!(job_id = %job.id, queue = %self.queue, "processing job");
            self.process_job(job.id, job.spec, cancel).await?;
        }
    }

    async fn process_job(
        &self,
        job_id: String,
        spec: Vec<u8>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut client = self.client.clone();
        let (state_tx, mut state_rx) = mpsc::channel::<Vec<u8>>(1);
        let child = cancel.child_token();
        let handle = tokio::spawn((self.callback)(child.clone(), spec, state_tx));

        // Forward progress while the callback runs; the channel closes when
        // the callback drops its sender.
        while let Some(state) = state_rx.recv().await {
            client
                .heartbeat(HeartbeatRequest {
                    job_id: job_id.clone(),
                    state,
                    finished: false,
                })
                .await?;
        }

        let result = handle
            .await
            .map_err(|err| BackplaneError::Internal(format!("job callback panicked: {}", err)));
        // Anything the callback still spawned under its token stops here.
        child.cancel();

        match result? {
            Ok(()) => {
                client
                    .heartbeat(HeartbeatRequest {
                        job_id,
                        state: Vec::new(),
                        finished: true,
                    })
                    .await?;
                Ok(())
            }
            Err(err) => Err(BackplaneError::Internal(format!(
                "job callback failed: {}",
                err
            ))),
        }
    }
}
