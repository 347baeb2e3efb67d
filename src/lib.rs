pub mod config;
pub mod cronjobs;
pub mod db;
pub mod error;
pub mod events;
pub mod grpc;
pub mod health;
pub mod jobs;
pub mod locks;
pub mod shutdown;
pub mod sql;
pub mod ticker;
pub mod tls;
pub mod worker;

// Re-export generated protobuf types
pub mod proto {
    tonic::include_proto!("backplane");
}
