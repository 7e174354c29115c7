use std::net::SocketAddr;

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    sync::{
        mpsc::{self, UnboundedReceiver},
        oneshot,
    },
};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, span, trace, warn, Instrument, Level};
use url::Url;

use crate::{
    codec::{ByteReader, CodecError},
    msg::DynamicMessage,
    tcpros::{
        self,
        header::{HeaderError, RawHeader, ServiceClientHeader, ServiceServerHeader},
        service::{ServiceType, RPC_FAILURE, RPC_SUCCESS},
        HeaderMismatch, ROS_WILDCARD,
    },
    xmlrpc::{ClientError, MasterClient},
};

#[derive(thiserror::Error, Debug)]
pub enum ServiceCallError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Header(#[from] HeaderError),
    #[error("master lookup failed: {0}")]
    Master(#[from] ClientError),
    #[error("failed to resolve service url \"{0}\" to an address")]
    ServiceResolution(String),
    #[error("incompatible headers: {0}")]
    Mismatch(#[from] HeaderMismatch),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("RPC response contained invalid status code: {0}")]
    InvalidStatusCode(u8),
    #[error("service reported failure: {0}")]
    Rpc(String),
    #[error("service client is shut down")]
    Closed,
}

pub struct RpcMsg {
    pub request: DynamicMessage,
    pub reply_tx: oneshot::Sender<Result<DynamicMessage, ServiceCallError>>,
}

struct ConnectionState {
    address: SocketAddr,
    stream: TcpStream,
    server_header: ServiceServerHeader,
}

/// The client side of one service: resolves the provider through the
/// master, probes its type, and pipelines calls over a (optionally
/// persistent) TCPROS connection.
pub struct ServiceClientLink {
    srv_type: ServiceType,
    rpc_tx: mpsc::UnboundedSender<RpcMsg>,
    _drop_guard: DropGuard,
}

impl ServiceClientLink {
    pub fn new(
        service_name: &str,
        srv_type: ServiceType,
        caller_id: &str,
        persistent: bool,
        master_client: MasterClient,
    ) -> Self {
        let (rpc_tx, rpc_rx) = mpsc::unbounded_channel::<RpcMsg>();
        let cancel_token = CancellationToken::new();

        let probe_header_bytes = ServiceClientHeader::probe(caller_id, service_name);

        let call_header_bytes = ServiceClientHeader {
            caller_id: caller_id.to_string(),
            service: service_name.to_string(),
            md5sum: srv_type.md5sum().to_string(),
            msg_type: srv_type.name().to_string(),
            persistent,
        }
        .to_bytes();

        let span = span!(
            parent: None,
            Level::DEBUG,
            "service_client",
            service = service_name.to_string(),
            persistent = persistent,
        );

        {
            let worker = ClientWorker {
                service_name: service_name.to_string(),
                srv_type: srv_type.clone(),
                master_client,
                persistent,
                call_header_bytes,
                probe_header_bytes,
            };
            let cancel_token = cancel_token.clone();

            tokio::spawn(
                async move {
                    worker.run(rpc_rx, cancel_token).await;
                    trace!("Service client task exited");
                }
                .instrument(span),
            );
        }

        ServiceClientLink {
            srv_type,
            rpc_tx,
            _drop_guard: cancel_token.drop_guard(),
        }
    }

    pub fn srv_type(&self) -> &ServiceType {
        &self.srv_type
    }

    pub async fn call(&self, request: DynamicMessage) -> Result<DynamicMessage, ServiceCallError> {
        let (reply_tx, reply_rx) = oneshot::channel();

        self.rpc_tx
            .send(RpcMsg { request, reply_tx })
            .map_err(|_| ServiceCallError::Closed)?;

        reply_rx.await.map_err(|_| ServiceCallError::Closed)?
    }
}

struct ClientWorker {
    service_name: String,
    srv_type: ServiceType,
    master_client: MasterClient,
    persistent: bool,
    call_header_bytes: Vec<u8>,
    probe_header_bytes: Vec<u8>,
}

impl ClientWorker {
    async fn run(&self, mut rpc_rx: UnboundedReceiver<RpcMsg>, cancel_token: CancellationToken) {
        debug!("Service client task started");
        let mut connection_state: Option<ConnectionState> = None;

        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => {
                    trace!("Service client task stopped by cancel token");
                    break;
                }

                rpc_msg = rpc_rx.recv() => {
                    let Some(RpcMsg { request, reply_tx }) = rpc_msg else {
                        debug!("Internal channel for service client was closed");
                        break;
                    };

                    let handler_result = async {
                        let mut connection = match connection_state.take() {
                            Some(state) => {
                                trace!("Reusing persistent connection for RPC");
                                state
                            }
                            None => self.connect().await?,
                        };

                        let span = span!(
                            Level::DEBUG,
                            "rpc_call",
                            server_id = connection.server_header.caller_id.clone(),
                            server_addr = connection.address.to_string(),
                        );

                        let rpc_result = self
                            .handle_rpc(request, &mut connection.stream)
                            .instrument(span)
                            .await;

                        if self.persistent && rpc_result.is_ok() {
                            connection_state = Some(connection);
                        }

                        rpc_result
                    }
                    .await;

                    if reply_tx.send(handler_result).is_err() {
                        warn!("Failed to send RPC result to client handle, channel closed");
                    }
                }
            }
        }
    }

    async fn resolve_address(&self) -> Result<SocketAddr, ServiceCallError> {
        trace!("Resolving address for service");

        let service_uri = self.master_client.lookup_service(&self.service_name).await?;

        let service_url = Url::parse(&service_uri)
            .map_err(|_| ServiceCallError::ServiceResolution(service_uri.clone()))?;

        let address = service_url
            .socket_addrs(|| None)
            .map_err(|_| ServiceCallError::ServiceResolution(service_uri.clone()))?
            .first()
            .cloned()
            .ok_or(ServiceCallError::ServiceResolution(service_uri))?;

        trace!("Resolved service to \"{address}\"");
        Ok(address)
    }

    async fn probe(&self, address: &SocketAddr) -> Result<(), ServiceCallError> {
        let mut stream = TcpStream::connect(address).await?;
        stream.write_all(&self.probe_header_bytes).await?;

        let raw_header = RawHeader::from_async_read(&mut stream).await?;
        let server_header = ServiceServerHeader::from_raw(&raw_header)?;

        let compatible = server_header.md5sum == ROS_WILDCARD
            || server_header.md5sum == self.srv_type.md5sum();

        if !compatible {
            return Err(HeaderMismatch::Md5 {
                expected: self.srv_type.md5sum().to_string(),
                actual: server_header.md5sum,
            }
            .into());
        }

        Ok(())
    }

    async fn connect(&self) -> Result<ConnectionState, ServiceCallError> {
        let address = self.resolve_address().await?;

        self.probe(&address).await?;

        let mut stream = TcpStream::connect(address).await?;
        stream.write_all(&self.call_header_bytes).await?;

        let raw_header = RawHeader::from_async_read(&mut stream).await?;
        let server_header = ServiceServerHeader::from_raw(&raw_header)?;

        Ok(ConnectionState {
            address,
            stream,
            server_header,
        })
    }

    async fn handle_rpc(
        &self,
        request: DynamicMessage,
        stream: &mut TcpStream,
    ) -> Result<DynamicMessage, ServiceCallError> {
        let body = request.serialize_vec()?;
        stream.write_all(&tcpros::frame(&body)).await?;

        match stream.read_u8().await? {
            RPC_SUCCESS => {
                let response_bytes = tcpros::read_tcpros_frame(stream).await?;

                Ok(DynamicMessage::deserialize_slice(
                    self.srv_type.response().schema().clone(),
                    &response_bytes,
                )?)
            }
            RPC_FAILURE => {
                let error_bytes = tcpros::read_tcpros_frame(stream).await?;
                let message = ByteReader::new(&error_bytes).read_string()?;
                let error = ServiceCallError::Rpc(message);
                warn!("{error}");

                Err(error)
            }
            mystery_code => {
                let error = ServiceCallError::InvalidStatusCode(mystery_code);
                error!("{error}");

                Err(error)
            }
        }
    }
}
