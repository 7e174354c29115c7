use std::sync::Arc;

use async_trait::async_trait;
use tokio::{
    io::AsyncWriteExt,
    net::{TcpListener, TcpStream},
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, span, trace, warn, Instrument, Level};

use crate::tcpros::{
    header::{error_header, RawHeader},
    publication::PublicationMsg,
    service::server::ServiceServerMsg,
};

/// Resolves an inbound connection's header to the publication or service
/// that should own it. Implemented by the node over its registry actors.
#[async_trait]
pub trait ConnectionRouter: Send + Sync {
    async fn route_topic(&self, topic: &str) -> Option<mpsc::Sender<PublicationMsg>>;
    async fn route_service(&self, service: &str) -> Option<mpsc::Sender<ServiceServerMsg>>;
}

/// The node's single TCPROS accept loop, bound once at node start.
///
/// Every peer announces its target in the connection header (`topic` for
/// subscribers, `service` for service clients); the stream is handed to the
/// matching worker, or answered with an `error` header.
pub async fn serve(
    listener: TcpListener,
    router: Arc<dyn ConnectionRouter>,
    cancel_token: CancellationToken,
) {
    debug!("TCPROS listener started");

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                trace!("TCPROS listener stopped by cancel token");
                break;
            }

            connection = listener.accept() => {
                let (stream, address) = match connection {
                    Ok(connection) => connection,
                    Err(e) => {
                        error!("Failed to accept TCPROS connection: {e}");
                        continue;
                    }
                };

                let router = router.clone();
                let span = span!(
                    Level::DEBUG,
                    "tcpros_accept",
                    peer_addr = address.to_string(),
                );

                tokio::spawn(
                    async move {
                        if let Err(e) = route_connection(stream, router).await {
                            warn!("Failed to route TCPROS connection: {e}");
                        }
                    }
                    .instrument(span),
                );
            }
        }
    }

    trace!("TCPROS listener exited");
}

async fn route_connection(
    mut stream: TcpStream,
    router: Arc<dyn ConnectionRouter>,
) -> Result<(), crate::tcpros::LinkError> {
    let raw_header = RawHeader::from_async_read(&mut stream).await?;

    if let Some(topic) = raw_header.get("topic").map(str::to_string) {
        trace!("Inbound subscriber for topic \"{topic}\"");

        return match router.route_topic(&topic).await {
            Some(publication) => {
                let _ = publication
                    .send(PublicationMsg::Accept { stream, raw_header })
                    .await;
                Ok(())
            }
            None => {
                let reason = format!("node is not publishing topic \"{topic}\"");
                stream.write_all(&error_header(&reason)).await?;
                Ok(())
            }
        };
    }

    if let Some(service) = raw_header.get("service").map(str::to_string) {
        trace!("Inbound service client for \"{service}\"");

        return match router.route_service(&service).await {
            Some(server) => {
                let _ = server
                    .send(ServiceServerMsg::Accept { stream, raw_header })
                    .await;
                Ok(())
            }
            None => {
                let reason = format!("node does not provide service \"{service}\"");
                stream.write_all(&error_header(&reason)).await?;
                Ok(())
            }
        };
    }

    warn!("Connection header names neither a topic nor a service");
    stream
        .write_all(&error_header("header must name a topic or service"))
        .await?;

    Ok(())
}
