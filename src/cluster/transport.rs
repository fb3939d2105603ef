//! Streaming transport seam for peer connections
//!
//! The forwarder talks to its peer through these traits; the gRPC transport
//! below is the production implementation, tests substitute their own.

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Endpoint};

use super::TlsSettings;
use crate::config::INGRESS_DEPTH;
use crate::proto::{self, timeseries_client::TimeseriesClient};
use crate::{KairoError, Result};

/// One live client-streaming write
#[async_trait]
pub trait WriteStream: Send {
    /// Send one point. [`KairoError::StreamClosed`] means the peer ended the
    /// stream cleanly.
    async fn send(&mut self, point: proto::Point) -> Result<()>;

    /// Half-close and wait for the peer's acknowledgement
    async fn close_and_recv(self: Box<Self>) -> Result<proto::WriteAck>;
}

/// Request half of a live meta exchange
#[async_trait]
pub trait MetaSink: Send {
    /// Send one lookup request
    async fn send(&mut self, meta: proto::Meta) -> Result<()>;

    /// Half-close the request stream
    async fn close_send(self: Box<Self>) -> Result<()>;
}

/// Streaming RPC surface of one downstream peer
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open a client-streaming write
    async fn open_write(&self) -> Result<Box<dyn WriteStream>>;

    /// Open a server-streaming range read
    async fn open_read(
        &self,
        query: proto::Query,
    ) -> Result<BoxStream<'static, Result<proto::Point>>>;

    /// Open a bidirectional meta exchange
    async fn open_meta(
        &self,
    ) -> Result<(Box<dyn MetaSink>, BoxStream<'static, Result<proto::MetaFound>>)>;
}

/// gRPC transport over a lazily-connected channel
pub struct GrpcTransport {
    client: TimeseriesClient<Channel>,
}

impl GrpcTransport {
    /// Build the transport for `address:port`. The channel connects on first
    /// use, so an unreachable peer does not fail construction; its batches
    /// spill to the WAL until it comes back.
    pub fn connect(address: &str, port: u16, tls: Option<&TlsSettings>) -> Result<Self> {
        let scheme = if tls.is_some() { "https" } else { "http" };
        let endpoint = Endpoint::from_shared(format!("{}://{}:{}", scheme, address, port))
            .map_err(|e| KairoError::Transport(e.to_string()))?;

        let endpoint = match tls {
            Some(settings) => {
                let pem = std::fs::read(&settings.ca_cert)?;
                endpoint
                    .tls_config(
                        ClientTlsConfig::new()
                            .ca_certificate(Certificate::from_pem(pem))
                            .domain_name(settings.domain_name.clone()),
                    )
                    .map_err(|e| KairoError::Transport(e.to_string()))?
            }
            None => endpoint,
        };

        Ok(Self {
            client: TimeseriesClient::new(endpoint.connect_lazy()),
        })
    }
}

#[async_trait]
impl Transport for GrpcTransport {
    async fn open_write(&self) -> Result<Box<dyn WriteStream>> {
        let (tx, rx) = mpsc::channel(INGRESS_DEPTH);
        let (ack_tx, ack_rx) = oneshot::channel();

        let mut client = self.client.clone();
        tokio::spawn(async move {
            let outcome = client.write(ReceiverStream::new(rx)).await;
            let _ = ack_tx.send(outcome.map(tonic::Response::into_inner));
        });

        Ok(Box::new(GrpcWriteStream { tx, ack: ack_rx }))
    }

    async fn open_read(
        &self,
        query: proto::Query,
    ) -> Result<BoxStream<'static, Result<proto::Point>>> {
        let mut client = self.client.clone();
        let stream = client.read(query).await.map_err(status_error)?.into_inner();
        Ok(stream.map(|item| item.map_err(status_error)).boxed())
    }

    async fn open_meta(
        &self,
    ) -> Result<(Box<dyn MetaSink>, BoxStream<'static, Result<proto::MetaFound>>)> {
        let (tx, rx) = mpsc::channel(INGRESS_DEPTH);

        let mut client = self.client.clone();
        let stream = client
            .get_meta(ReceiverStream::new(rx))
            .await
            .map_err(status_error)?
            .into_inner();

        Ok((
            Box::new(GrpcMetaSink { tx }),
            stream.map(|item| item.map_err(status_error)).boxed(),
        ))
    }
}

struct GrpcWriteStream {
    tx: mpsc::Sender<proto::Point>,
    ack: oneshot::Receiver<std::result::Result<proto::WriteAck, tonic::Status>>,
}

#[async_trait]
impl WriteStream for GrpcWriteStream {
    async fn send(&mut self, point: proto::Point) -> Result<()> {
        // The request task dropping its receiver is how an early hang-up by
        // the peer surfaces here.
        self.tx
            .send(point)
            .await
            .map_err(|_| KairoError::StreamClosed)
    }

    async fn close_and_recv(self: Box<Self>) -> Result<proto::WriteAck> {
        drop(self.tx);
        match self.ack.await {
            Ok(Ok(ack)) => Ok(ack),
            Ok(Err(status)) => Err(status_error(status)),
            Err(_) => Err(KairoError::Transport("write request task vanished".into())),
        }
    }
}

struct GrpcMetaSink {
    tx: mpsc::Sender<proto::Meta>,
}

#[async_trait]
impl MetaSink for GrpcMetaSink {
    async fn send(&mut self, meta: proto::Meta) -> Result<()> {
        self.tx
            .send(meta)
            .await
            .map_err(|_| KairoError::StreamClosed)
    }

    async fn close_send(self: Box<Self>) -> Result<()> {
        // Dropping the sender half-closes the request stream.
        Ok(())
    }
}

fn status_error(status: tonic::Status) -> KairoError {
    KairoError::Transport(status.to_string())
}
