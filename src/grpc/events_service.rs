use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status};

use crate::events::{Event, Events};
use crate::grpc::{from_timestamp, to_timestamp};
use crate::proto;
use crate::proto::events_server::Events as EventsRpc;

/// gRPC façade over the event log core.
pub struct EventsService {
    core: Events,
    shutdown: CancellationToken,
}

impl EventsService {
    pub fn new(core: Events, shutdown: CancellationToken) -> Self {
        Self { core, shutdown }
    }
}

fn event_to_proto(event: Event) -> proto::Event {
    proto::Event {
        id: event.id.to_string(),
        topic: event.topic,
        payload: event.payload,
        labels: event.labels,
        created_at: Some(to_timestamp(event.created_at)),
        sequence: event.sequence as u64,
    }
}

#[tonic::async_trait]
impl EventsRpc for EventsService {
    async fn publish(
        &self,
        request: Request<proto::PublishRequest>,
    ) -> Result<Response<proto::Event>, Status> {
        let req = request.into_inner();
        let event = self
            .core
            .publish(&req.topic, req.payload, req.labels)
            .await?;
        Ok(Response::new(event_to_proto(event)))
    }

    type SubscribeStream = ReceiverStream<Result<proto::Event, Status>>;

    async fn subscribe(
        &self,
        request: Request<proto::SubscribeRequest>,
    ) -> Result<Response<Self::SubscribeStream>, Status> {
        let req = request.into_inner();
        // Sequence zero means "from the beginning": sequences are assigned
        // starting at one.
        let since_sequence = if req.since_sequence == 0 {
            None
        } else {
            Some(req.since_sequence as i64)
        };
        let since_created_at = match &req.since_created_at {
            Some(ts) => Some(from_timestamp(ts)?),
            None => None,
        };

        let core = self.core.clone();
        let cancel = self.shutdown.child_token();
        let (tx, rx) = mpsc::channel::<Result<proto::Event, Status>>(1);
        let (event_tx, mut event_rx) = mpsc::channel::<Event>(1);

        let forward_tx = tx.clone();
        tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                if forward_tx.send(Ok(event_to_proto(event))).await.is_err() {
                    return;
                }
            }
        });
        tokio::spawn(async move {
            if let Err(err) = core
                .subscribe(
                    &req.topic,
                    req.labels,
                    since_sequence,
                    since_created_at,
                    event_tx,
                    cancel,
                )
                .await
            {
                let _ = tx.send(Err(Status::from(err))).await;
            }
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }
}
