//! CLI client: submit, inspect and list jobs on a running server.

use clap::Parser;

use backplane::proto::jobs_client::JobsClient;
use backplane::proto::{CreateJobRequest, GetJobRequest, ListJobsRequest};

#[derive(Parser, Debug)]
#[command(name = "submit-job")]
#[command(about = "CLI client for the backplane jobs service")]
struct Args {
    /// Server address
    #[arg(long, default_value = "http://127.0.0.1:3001")]
    addr: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Submit a new job
    Submit {
        /// Queue to publish into
        #[arg(short, long, default_value = "example")]
        queue: String,
        /// Job spec, e.g. a JSON document
        #[arg(short, long)]
        spec: String,
    },
    /// Get a job by id
    Status {
        #[arg(short, long)]
        job_id: String,
    },
    /// List jobs, optionally scoped to one queue
    List {
        #[arg(short, long)]
        queue: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let mut client = JobsClient::connect(args.addr).await?;

    match args.command {
        Commands::Submit { queue, spec } => {
            let job = client
                .create(CreateJobRequest {
                    queue,
                    spec: spec.into_bytes(),
                    labels: Default::default(),
                })
                .await?
                .into_inner();
            println!("submitted job {} to queue {}", job.id, job.queue);
        }
        Commands::Status { job_id } => {
            let job = client.get(GetJobRequest { id: job_id }).await?.into_inner();
            println!(
                "job {} queue={} started={} finished={}",
                job.id,
                job.queue,
                job.started_at.is_some(),
                job.finished_at.is_some()
            );
        }
        Commands::List { queue } => {
            let mut stream = client
                .list(ListJobsRequest {
                    queues: queue.into_iter().collect(),
                    labels: Default::default(),
                    exclude_finished: false,
                })
                .await?
                .into_inner();
            while let Some(job) = stream.message().await? {
                println!(
                    "{}  {}  finished={}",
                    job.id,
                    job.queue,
                    job.finished_at.is_some()
                );
            }
        }
    }

    Ok(())
}
