use std::sync::Arc;

use futures_util::future::BoxFuture;
use tokio::{
    io::AsyncWriteExt,
    net::TcpStream,
    sync::mpsc,
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, span, trace, warn, Instrument, Level};

use crate::{
    codec::ByteWriter,
    msg::DynamicMessage,
    tcpros::{
        self,
        header::{error_header, RawHeader, ServiceClientHeader, ServiceServerHeader},
        service::{ServiceType, RPC_FAILURE, RPC_SUCCESS},
        LinkError, ROS_WILDCARD,
    },
};

/// Handles one decoded request; an `Err` string travels back to the caller
/// as the RPC failure message.
pub type ServiceCallback =
    Arc<dyn Fn(DynamicMessage) -> BoxFuture<'static, Result<DynamicMessage, String>> + Send + Sync>;

pub enum ServiceServerMsg {
    Accept {
        stream: TcpStream,
        raw_header: RawHeader,
    },
}

/// One advertised service: accepts client connections routed over from the
/// node listener and answers framed request/response RPCs.
pub struct ServiceServerLink {
    service_name: String,
    control_tx: mpsc::Sender<ServiceServerMsg>,
    cancel_token: CancellationToken,
    task: JoinHandle<()>,
}

impl ServiceServerLink {
    pub fn new(
        service_name: &str,
        srv_type: ServiceType,
        caller_id: &str,
        callback: ServiceCallback,
    ) -> Self {
        let (control_tx, control_rx) = mpsc::channel(16);
        let cancel_token = CancellationToken::new();

        let worker = ServerWorker {
            service_name: service_name.to_string(),
            caller_id: caller_id.to_string(),
            srv_type,
            callback,
        };

        let span = span!(
            parent: None,
            Level::DEBUG,
            "service_server",
            service = service_name.to_string(),
        );

        let task = tokio::spawn(
            worker
                .run(control_rx, cancel_token.clone())
                .instrument(span),
        );

        ServiceServerLink {
            service_name: service_name.to_string(),
            control_tx,
            cancel_token,
            task,
        }
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn control(&self) -> mpsc::Sender<ServiceServerMsg> {
        self.control_tx.clone()
    }

    pub async fn shutdown(self) {
        self.cancel_token.cancel();

        if let Err(e) = self.task.await {
            warn!("Service server task did not shut down cleanly: {e}");
        }
    }
}

struct ServerWorker {
    service_name: String,
    caller_id: String,
    srv_type: ServiceType,
    callback: ServiceCallback,
}

impl ServerWorker {
    async fn run(
        self,
        mut control_rx: mpsc::Receiver<ServiceServerMsg>,
        cancel_token: CancellationToken,
    ) {
        debug!("Service server loop started");

        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => {
                    trace!("Service server loop stopped by cancel token");
                    break;
                }

                control_msg = control_rx.recv() => {
                    let Some(ServiceServerMsg::Accept { stream, raw_header }) = control_msg else {
                        debug!("Service server control channel closed");
                        break;
                    };

                    if let Err(e) = self.accept(stream, raw_header, &cancel_token).await {
                        warn!("Failed to set up service client connection: {e}");
                    }
                }
            }
        }

        trace!("Service server loop exited");
    }

    async fn accept(
        &self,
        mut stream: TcpStream,
        raw_header: RawHeader,
        cancel_token: &CancellationToken,
    ) -> Result<(), LinkError> {
        let client_header = ServiceClientHeader::from_raw(&raw_header)?;

        let compatible = client_header.md5sum == ROS_WILDCARD
            || client_header.md5sum == self.srv_type.md5sum();

        if !compatible {
            let reason = format!(
                "md5sum mismatch: {} != {}",
                self.srv_type.md5sum(),
                client_header.md5sum
            );
            let _ = stream.write_all(&error_header(&reason)).await;
            return Err(crate::tcpros::HeaderMismatch::Md5 {
                expected: self.srv_type.md5sum().to_string(),
                actual: client_header.md5sum,
            }
            .into());
        }

        let reply = ServiceServerHeader {
            caller_id: self.caller_id.clone(),
            md5sum: self.srv_type.md5sum().to_string(),
            msg_type: self.srv_type.name().to_string(),
        };

        stream.write_all(&reply.to_bytes()).await?;

        // Probe connections only want the type information.
        let probing = raw_header.get("probe") == Some("1");
        if probing {
            trace!("Answered probe from \"{}\"", client_header.caller_id);
            return Ok(());
        }

        let span = span!(
            Level::DEBUG,
            "service_rpc",
            client_id = client_header.caller_id.clone(),
            persistent = client_header.persistent,
        );

        let srv_type = self.srv_type.clone();
        let callback = self.callback.clone();
        let cancel_token = cancel_token.clone();
        let persistent = client_header.persistent;

        tokio::spawn(
            async move {
                if let Err(e) =
                    rpc_task(stream, srv_type, callback, persistent, cancel_token).await
                {
                    debug!("Service RPC connection closed: {e}");
                }
            }
            .instrument(span),
        );

        Ok(())
    }
}

async fn rpc_task(
    mut stream: TcpStream,
    srv_type: ServiceType,
    callback: ServiceCallback,
    persistent: bool,
    cancel_token: CancellationToken,
) -> Result<(), LinkError> {
    loop {
        let request_bytes = tokio::select! {
            _ = cancel_token.cancelled() => return Ok(()),
            frame = tcpros::read_tcpros_frame(&mut stream) => frame?,
        };

        let request =
            DynamicMessage::deserialize_slice(srv_type.request().schema().clone(), &request_bytes);

        let outcome = match request {
            Ok(request) => callback(request).await,
            Err(e) => Err(format!("failed to decode request: {e}")),
        };

        match outcome {
            Ok(response) => match response.serialize_vec() {
                Ok(body) => {
                    stream.write_u8(RPC_SUCCESS).await?;
                    stream.write_all(&tcpros::frame(&body)).await?;
                }
                Err(e) => {
                    write_failure(&mut stream, &format!("failed to encode response: {e}")).await?;
                }
            },
            Err(message) => {
                write_failure(&mut stream, &message).await?;
            }
        }

        if !persistent {
            return Ok(());
        }
    }
}

async fn write_failure(stream: &mut TcpStream, message: &str) -> Result<(), LinkError> {
    let mut writer = ByteWriter::new();
    writer.write_string(message);

    stream.write_u8(RPC_FAILURE).await?;
    stream.write_all(&tcpros::frame(&writer.into_vec())).await?;
    Ok(())
}
