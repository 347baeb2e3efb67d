use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};
use uuid::Uuid;

use crate::cronjobs::{CronJob, CronJobs};
use crate::grpc::{parse_id, to_timestamp};
use crate::proto;
use crate::proto::cron_jobs_server::CronJobs as CronJobsRpc;

/// gRPC façade over the cron schedules core.
pub struct CronJobsService {
    core: CronJobs,
}

impl CronJobsService {
    pub fn new(core: CronJobs) -> Self {
        Self { core }
    }
}

fn cronjob_to_proto(cronjob: CronJob) -> proto::CronJob {
    proto::CronJob {
        id: cronjob.id.to_string(),
        queue: cronjob.queue,
        name: cronjob.name.unwrap_or_default(),
        spec: cronjob.spec,
        cron: cronjob.cron,
        labels: cronjob.labels,
        created_at: Some(to_timestamp(cronjob.created_at)),
        next_run_at: Some(to_timestamp(cronjob.next_run_at)),
    }
}

/// A lookup selector accepts an id, a name, or both.
fn selector(id: &str, name: &str) -> Result<(Option<Uuid>, Option<String>), Status> {
    let id = if id.is_empty() {
        None
    } else {
        Some(parse_id(id)?)
    };
    let name = if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    };
    Ok((id, name))
}

#[tonic::async_trait]
impl CronJobsRpc for CronJobsService {
    async fn create(
        &self,
        request: Request<proto::CreateCronJobRequest>,
    ) -> Result<Response<proto::CronJob>, Status> {
        let req = request.into_inner();
        let name = if req.name.is_empty() {
            None
        } else {
            Some(req.name)
        };
        let cronjob = self
            .core
            .create(&req.queue, name, &req.cron, req.spec, req.labels)
            .await?;
        Ok(Response::new(cronjob_to_proto(cronjob)))
    }

    async fn get(
        &self,
        request: Request<proto::GetCronJobRequest>,
    ) -> Result<Response<proto::CronJob>, Status> {
        let req = request.into_inner();
        let (id, name) = selector(&req.id, &req.name)?;
        let cronjob = self.core.get(id, name.as_deref()).await?;
        Ok(Response::new(cronjob_to_proto(cronjob)))
    }

    async fn delete(
        &self,
        request: Request<proto::DeleteCronJobRequest>,
    ) -> Result<Response<proto::CronJob>, Status> {
        let req = request.into_inner();
        let (id, name) = selector(&req.id, &req.name)?;
        let cronjob = self.core.delete(id, name.as_deref()).await?;
        Ok(Response::new(cronjob_to_proto(cronjob)))
    }

    type ListStream = ReceiverStream<Result<proto::CronJob, Status>>;

    async fn list(
        &self,
        request: Request<proto::ListCronJobsRequest>,
    ) -> Result<Response<Self::ListStream>, Status> {
        let req = request.into_inner();
        let cronjobs = self.core.list(&req.queues, &req.labels).await?;

        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            for cronjob in cronjobs {
                if tx.send(Ok(cronjob_to_proto(cronjob))).await.is_err() {
                    return;
                }
            }
        });
        Ok(Response::new(ReceiverStream::new(rx)))
    }
}
