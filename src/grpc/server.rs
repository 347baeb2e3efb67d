use std::net::SocketAddr;

use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;

use crate::config::{Component, CoreConfig};
use crate::cronjobs::CronJobs;
use crate::error::Result;
use crate::events::Events;
use crate::grpc::cronjobs_service::CronJobsService;
use crate::grpc::events_service::EventsService;
use crate::grpc::jobs_service::JobsService;
use crate::grpc::locks_service::LocksService;
use crate::jobs::Jobs;
use crate::locks::Locks;
use crate::proto::cron_jobs_server::CronJobsServer;
use crate::proto::events_server::EventsServer;
use crate::proto::jobs_server::JobsServer;
use crate::proto::locks_server::LocksServer;
use crate::tls::TlsIdentity;

/// Assembles the enabled component services into one tonic server and runs
/// it until the shutdown token fires. Table creation happens lazily here,
/// per enabled component.
pub struct GrpcServer {
    addr: SocketAddr,
    components: Vec<Component>,
    tls: Option<TlsIdentity>,
    pool: PgPool,
    config: CoreConfig,
}

impl GrpcServer {
    pub fn new(
        addr: SocketAddr,
        components: Vec<Component>,
        tls: Option<TlsIdentity>,
        pool: PgPool,
        config: CoreConfig,
    ) -> Self {
        Self {
            addr,
            components,
            tls,
            pool,
            config,
        }
    }

    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let enabled = |component: Component| self.components.contains(&component);

        let jobs_core = Jobs::new(self.pool.clone(), self.config);

        let jobs_service = if enabled(Component::Jobs) {
            jobs_core.init().await?;
            Some(JobsServer::new(JobsService::new(
                jobs_core.clone(),
                cancel.clone(),
            )))
        } else {
            None
        };

        let cronjobs_service = if enabled(Component::Cronjobs) {
            // Materialization writes into the jobs table, which must exist
            // even when the jobs component is served elsewhere.
            jobs_core.init().await?;
            let cronjobs_core = CronJobs::new(self.pool.clone(), self.config, jobs_core.clone());
            cronjobs_core.init().await?;

            let backend = cronjobs_core.clone();
            let backend_cancel = cancel.clone();
            tokio::spawn(async move { backend.run_backend(backend_cancel).await });

            Some(CronJobsServer::new(CronJobsService::new(cronjobs_core)))
        } else {
            None
        };

        let locks_service = if enabled(Component::Locks) {
            let locks_core = Locks::new(self.pool.clone(), self.config);
            locks_core.init().await?;
            Some(LocksServer::new(LocksService::new(
                locks_core,
                cancel.clone(),
            )))
        } else {
            None
        };

        let events_service = if enabled(Component::Events) {
            let events_core = Events::new(self.pool.clone(), self.config);
            events_core.init().await?;
            Some(EventsServer::new(EventsService::new(
                events_core,
                cancel.clone(),
            )))
        } else {
            None
        };

        let mut builder = Server::builder();
        if let Some(tls) = &self.tls {
            builder = builder.tls_config(tls.server_tls_config())?;
        }

        tracing::info!(addr = %self.addr, components = ?self.components, "starting gRPC server");
        builder
            .add_optional_service(jobs_service)
            .add_optional_service(cronjobs_service)
            .add_optional_service(locks_service)
            .add_optional_service(events_service)
            .serve_with_shutdown(self.addr, cancel.cancelled())
            .await?;

        tracing::info!("gRPC server stopped");
        Ok(())
    }
}
