//! Example worker: takes a shared lock, publishes an acceptance event and
//! pretty-prints each job spec it receives.

use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use backplane::locks::hold_lock;
use backplane::proto::events_client::EventsClient;
use backplane::proto::jobs_client::JobsClient;
use backplane::proto::locks_client::LocksClient;
use backplane::proto::PublishRequest;
use backplane::shutdown::install_shutdown_handler;
use backplane::worker::Worker;

#[derive(Parser, Debug)]
#[command(name = "echo-worker")]
#[command(about = "Example worker that pretty-prints job specs")]
struct Args {
    /// Server address
    #[arg(long, default_value = "http://127.0.0.1:3001")]
    addr: String,

    /// Queue to listen on
    #[arg(long, default_value = "example")]
    queue: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let channel = tonic::transport::Endpoint::from_shared(args.addr.clone())?
        .connect()
        .await?;
    let jobs = JobsClient::new(channel.clone());
    let locks = LocksClient::new(channel.clone());
    let events = EventsClient::new(channel);

    let worker = Worker::new(jobs, args.queue, move |ctx, spec, state| {
        let locks = locks.clone();
        let mut events = events.clone();
        async move {
            // Only one echo worker runs at a time; the lock is released when
            // the job context ends.
            hold_lock(locks, "echo-lock", Duration::from_secs(10), ctx.clone()).await?;

            events
                .publish(PublishRequest {
                    topic: "echo-work-accepted".to_string(),
                    payload: spec.clone(),
                    labels: Default::default(),
                })
                .await?;

            // The actual "work": parse the spec and pretty-print it.
            let doc: serde_json::Value = serde_json::from_slice(&spec)?;
            println!("{}", serde_json::to_string_pretty(&doc)?);

            state
                .send(b"spec printed".to_vec())
                .await
                .map_err(|_| "state channel closed")?;
            Ok(())
        }
    });

    let cancel = install_shutdown_handler();
    worker.work(cancel).await?;
    Ok(())
}
