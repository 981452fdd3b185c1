use std::pin::Pin;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::Stream;
use tonic::{Request, Response, Status, Streaming};

use crate::pb::test_service_server::TestService;
use crate::pb::{CollectSummary, EchoRequest, EchoResponse, ItemChunk};

/// Echo-style implementation of `grpctest.TestService`.
pub struct TestServiceImpl;

#[tonic::async_trait]
impl TestService for TestServiceImpl {
    async fn unary_echo(
        &self,
        request: Request<EchoRequest>,
    ) -> Result<Response<EchoResponse>, Status> {
        let item = request.into_inner().item;
        Ok(Response::new(EchoResponse { ok: true, item }))
    }

    type StreamItemsStream = ReceiverStream<Result<ItemChunk, Status>>;

    async fn stream_items(
        &self,
        request: Request<EchoRequest>,
    ) -> Result<Response<Self::StreamItemsStream>, Status> {
        let item = request.into_inner().item;
        let (tx, rx) = mpsc::channel(4);
        tokio::spawn(async move {
            for seq in 0..3u32 {
                let chunk = ItemChunk {
                    seq,
                    item: item.clone(),
                };
                if tx.send(Ok(chunk)).await.is_err() {
                    break;
                }
            }
        });
        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn collect_items(
        &self,
        request: Request<Streaming<EchoRequest>>,
    ) -> Result<Response<CollectSummary>, Status> {
        let mut inbound = request.into_inner();
        let mut items = Vec::new();
        while let Some(req) = inbound.message().await? {
            if let Some(item) = req.item {
                items.push(item);
            }
        }
        Ok(Response::new(CollectSummary {
            count: items.len() as i32,
            items,
        }))
    }

    type BidiEchoStream =
        Pin<Box<dyn Stream<Item = Result<EchoResponse, Status>> + Send + 'static>>;

    async fn bidi_echo(
        &self,
        request: Request<Streaming<EchoRequest>>,
    ) -> Result<Response<Self::BidiEchoStream>, Status> {
        let mut inbound = request.into_inner();
        let (tx, rx) = mpsc::channel(8);
        tokio::spawn(async move {
            while let Ok(Some(req)) = inbound.message().await {
                let reply = EchoResponse {
                    ok: true,
                    item: req.item,
                };
                if tx.send(Ok(reply)).await.is_err() {
                    break;
                }
            }
        });
        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }
}
