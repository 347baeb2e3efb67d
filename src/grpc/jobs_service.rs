use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status};

use crate::grpc::{parse_id, to_timestamp};
use crate::jobs::{Job, Jobs};
use crate::proto;
use crate::proto::jobs_server::Jobs as JobsRpc;

/// gRPC façade over the jobs core.
pub struct JobsService {
    core: Jobs,
    shutdown: CancellationToken,
}

impl JobsService {
    pub fn new(core: Jobs, shutdown: CancellationToken) -> Self {
        Self { core, shutdown }
    }
}

pub(crate) fn job_to_proto(job: Job) -> proto::Job {
    proto::Job {
        id: job.id.to_string(),
        queue: job.queue,
        spec: job.spec,
        labels: job.labels,
        state: job.state.unwrap_or_default(),
        created_at: Some(to_timestamp(job.created_at)),
        started_at: job.started_at.map(to_timestamp),
        updated_at: job.updated_at.map(to_timestamp),
        finished_at: job.finished_at.map(to_timestamp),
    }
}

#[tonic::async_trait]
impl JobsRpc for JobsService {
    async fn create(
        &self,
        request: Request<proto::CreateJobRequest>,
    ) -> Result<Response<proto::Job>, Status> {
        let req = request.into_inner();
        let job = self.core.create(&req.queue, req.spec, req.labels).await?;
        Ok(Response::new(job_to_proto(job)))
    }

    async fn get(
        &self,
        request: Request<proto::GetJobRequest>,
    ) -> Result<Response<proto::Job>, Status> {
        let id = parse_id(&request.into_inner().id)?;
        let job = self.core.get(id).await?;
        Ok(Response::new(job_to_proto(job)))
    }

    async fn delete(
        &self,
        request: Request<proto::DeleteJobRequest>,
    ) -> Result<Response<proto::Job>, Status> {
        let id = parse_id(&request.into_inner().id)?;
        let job = self.core.delete(id).await?;
        Ok(Response::new(job_to_proto(job)))
    }

    async fn heartbeat(
        &self,
        request: Request<proto::HeartbeatRequest>,
    ) -> Result<Response<proto::Job>, Status> {
        let req = request.into_inner();
        let id = parse_id(&req.job_id)?;
        let state = if req.state.is_empty() {
            None
        } else {
            Some(req.state)
        };
        let job = self.core.heartbeat(id, state, req.finished).await?;
        Ok(Response::new(job_to_proto(job)))
    }

    type ListStream = ReceiverStream<Result<proto::Job, Status>>;

    async fn list(
        &self,
        request: Request<proto::ListJobsRequest>,
    ) -> Result<Response<Self::ListStream>, Status> {
        let req = request.into_inner();
        let jobs = self
            .core
            .list(&req.queues, &req.labels, req.exclude_finished)
            .await?;

        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            for job in jobs {
                if tx.send(Ok(job_to_proto(job))).await.is_err() {
                    return;
                }
            }
        });
        Ok(Response::new(ReceiverStream::new(rx)))
    }

    type ListenStream = ReceiverStream<Result<proto::Job, Status>>;

    async fn listen(
        &self,
        request: Request<proto::ListenRequest>,
    ) -> Result<Response<Self::ListenStream>, Status> {
        let queue = request.into_inner().queue;
        let core = self.core.clone();
        let cancel = self.shutdown.child_token();

        let (tx, rx) = mpsc::channel::<Result<proto::Job, Status>>(1);
        let (job_tx, mut job_rx) = mpsc::channel::<Job>(1);

        let forward_tx = tx.clone();
        tokio::spawn(async move {
            while let Some(job) = job_rx.recv().await {
                if forward_tx.send(Ok(job_to_proto(job))).await.is_err() {
                    return;
                }
            }
        });
        tokio::spawn(async move {
            if let Err(err) = core.listen(&queue, job_tx, cancel).await {
                let _ = tx.send(Err(Status::from(err))).await;
            }
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }
}
