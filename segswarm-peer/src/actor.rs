use std::future::Future;

use anyhow::anyhow;
use tokio::{
    sync::oneshot,
    task::{JoinError, JoinHandle},
};
use tokio_util::sync::CancellationToken;

use crate::Result;

/// Common interface for services that own their state and process requests
/// from a channel in a single task.
pub trait Actor {
    /// The type of request messages this service handles.
    type Request: Respondable;

    /// Run the service until cancelled.
    fn run(
        &mut self,
        cancel: CancellationToken,
        request_rx: flume::Receiver<Self::Request>,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Handle a request message, replying on its response channel.
    fn handle_request(&mut self, req: Self::Request) -> impl Future<Output = Result<()>> + Send;
}

/// A request that carries the channel its response is delivered on.
pub trait Respondable {
    type Response;

    fn set_response(&mut self, ch: ResponseChannel<Self::Response>);

    fn response_tx(self) -> ResponseChannel<Self::Response>;
}

/// Where a response goes. `Drop` discards it, for fire-and-forget requests.
#[derive(Debug, Default)]
pub enum ResponseChannel<T> {
    #[default]
    Drop,
    Oneshot(oneshot::Sender<T>),
}

impl<T> ResponseChannel<T> {
    pub fn send(self, resp: T) -> Result<()> {
        match self {
            ResponseChannel::Drop => Ok(()),
            ResponseChannel::Oneshot(tx) => tx
                .send(resp)
                .map_err(|_| anyhow!("response receiver dropped")),
        }
    }
}

/// Cloneable sending side of an actor's request channel.
pub struct Client<Req> {
    request_tx: flume::Sender<Req>,
}

impl<Req> Clone for Client<Req> {
    fn clone(&self) -> Self {
        Self {
            request_tx: self.request_tx.clone(),
        }
    }
}

impl<Req: Respondable + Send + 'static> Client<Req> {
    pub async fn send(&self, req: Req) -> Result<()> {
        self.request_tx
            .send_async(req)
            .await
            .map_err(|_| anyhow!("actor is not running"))
    }

    /// Send a request and wait for its response.
    pub async fn call(&self, mut req: Req) -> Result<Req::Response> {
        let (tx, rx) = oneshot::channel();
        req.set_response(ResponseChannel::Oneshot(tx));
        self.send(req).await?;
        Ok(rx.await?)
    }
}

/// Owns a running actor task.
pub struct Operator<Req> {
    cancel: CancellationToken,
    client: Client<Req>,
    task: JoinHandle<Result<()>>,
}

impl<Req: Respondable + Send + 'static> Operator<Req> {
    #[tracing::instrument(skip_all)]
    pub fn new<A: Actor<Request = Req> + Send + 'static>(
        cancel: CancellationToken,
        mut actor: A,
    ) -> Self {
        let (request_tx, request_rx) = flume::unbounded();
        let task_cancel = cancel.child_token();
        let task = tokio::spawn(async move { actor.run(task_cancel, request_rx).await });
        Self {
            cancel,
            client: Client { request_tx },
            task,
        }
    }

    pub fn client(&self) -> Client<Req> {
        self.client.clone()
    }

    pub async fn send(&self, req: Req) -> Result<()> {
        self.client.send(req).await
    }

    pub async fn call(&self, req: Req) -> Result<Req::Response> {
        self.client.call(req).await
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    #[tracing::instrument(skip_all)]
    pub async fn join(self) -> std::result::Result<Result<()>, JoinError> {
        self.task.await
    }
}
