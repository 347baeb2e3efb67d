use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use backplane::config::{parse_duration, Component, CoreConfig, ServerConfig, TlsConfig};
use backplane::db;
use backplane::grpc::GrpcServer;
use backplane::health::HealthServer;
use backplane::shutdown::install_shutdown_handler;
use backplane::tls::TlsIdentity;

#[derive(Parser, Debug)]
#[command(name = "backplane")]
#[command(about = "Job queue, cron scheduler, locks and event log over PostgreSQL")]
struct Args {
    /// Postgres connect string
    #[arg(
        long,
        default_value = "postgres://postgres@localhost:5432?sslmode=disable"
    )]
    db: String,

    /// gRPC listen address
    #[arg(long, default_value = "0.0.0.0:3001")]
    listen: SocketAddr,

    /// Components to serve
    #[arg(
        long,
        value_delimiter = ',',
        default_value = "jobs,cronjobs,locks,events"
    )]
    components: Vec<Component>,

    /// x509 certificate file (enables mTLS together with --key and --ca)
    #[arg(long)]
    cert: Option<PathBuf>,

    /// x509 private key file
    #[arg(long)]
    key: Option<PathBuf>,

    /// x509 CA certificate file
    #[arg(long)]
    ca: Option<PathBuf>,

    /// Health endpoint address
    #[arg(long, default_value = "0.0.0.0:8080")]
    metrics: SocketAddr,

    /// Log level filter
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Fallback polling interval for tickers and the cron backend
    #[arg(long, default_value = "10s", value_parser = parse_duration)]
    poll_interval: Duration,

    /// Started jobs without a heartbeat for this long become claimable again
    #[arg(long, default_value = "20s", value_parser = parse_duration)]
    heartbeat_deadline: Duration,

    /// Lock leases older than this can be taken over
    #[arg(long, default_value = "20s", value_parser = parse_duration)]
    hold_deadline: Duration,

    /// Relative deviation applied to ticker sleeps, in [0, 1]
    #[arg(long, default_value_t = 0.1)]
    jitter_factor: f64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(args.log_level.clone())),
        )
        .init();

    let cancel = install_shutdown_handler();

    let config = ServerConfig {
        db: args.db,
        listen_addr: args.listen,
        components: args.components,
        tls: TlsConfig {
            cert_path: args.cert,
            key_path: args.key,
            ca_cert_path: args.ca,
        },
        health_addr: Some(args.metrics),
        core: CoreConfig {
            poll_interval: args.poll_interval,
            heartbeat_deadline: args.heartbeat_deadline,
            hold_deadline: args.hold_deadline,
            jitter_factor: args.jitter_factor,
        },
    };

    let identity = if config.tls.is_configured() {
        Some(TlsIdentity::load(&config.tls).await?)
    } else {
        None
    };

    let pool = db::connect(&config.db, &cancel).await?;

    if let Some(health_addr) = config.health_addr {
        let health = HealthServer::bind(health_addr, pool.clone()).await?;
        let health_cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(err) = health.serve(health_cancel).await {
                tracing::error!(error = %err, "health listener failed");
            }
        });
    }

    let server = GrpcServer::new(
        config.listen_addr,
        config.components,
        identity,
        pool,
        config.core,
    );
    server.run(cancel).await?;

    tracing::info!("shutdown complete");
    Ok(())
}
