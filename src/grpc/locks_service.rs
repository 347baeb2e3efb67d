use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status};

use crate::locks::Locks;
use crate::proto;
use crate::proto::locks_server::Locks as LocksRpc;

/// gRPC façade over the locks core. `Acquire` blocks until ownership is
/// established or the call is cancelled.
pub struct LocksService {
    core: Locks,
    shutdown: CancellationToken,
}

impl LocksService {
    pub fn new(core: Locks, shutdown: CancellationToken) -> Self {
        Self { core, shutdown }
    }
}

#[tonic::async_trait]
impl LocksRpc for LocksService {
    async fn acquire(
        &self,
        request: Request<proto::AcquireRequest>,
    ) -> Result<Response<proto::AcquireResponse>, Status> {
        let id = request.into_inner().id;
        self.core.acquire(&id, self.shutdown.child_token()).await?;
        Ok(Response::new(proto::AcquireResponse { id }))
    }

    async fn hold(
        &self,
        request: Request<proto::HoldRequest>,
    ) -> Result<Response<proto::HoldResponse>, Status> {
        let id = request.into_inner().id;
        self.core.hold(&id).await?;
        Ok(Response::new(proto::HoldResponse { id }))
    }

    async fn release(
        &self,
        request: Request<proto::ReleaseRequest>,
    ) -> Result<Response<proto::ReleaseResponse>, Status> {
        let id = request.into_inner().id;
        self.core.release(&id).await?;
        Ok(Response::new(proto::ReleaseResponse { id }))
    }
}
