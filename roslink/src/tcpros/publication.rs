use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
};

use bytes::Bytes;
use futures_util::future::BoxFuture;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, span, trace, warn, Instrument, Level};

use crate::{
    codec::CodecError,
    msg::{DynamicMessage, MessageType},
    tcpros::{
        self,
        header::{self, PublisherHeader, RawHeader, SubscriberHeader},
        LinkError, Topic,
    },
};

/// Invoked once per newly admitted subscriber, before the connection joins
/// the broadcast set. The handle publishes to that one peer only.
pub type ConnectCallback =
    Arc<dyn Fn(SingleSubscriberPublisher) -> BoxFuture<'static, ()> + Send + Sync>;

/// Fire-and-forget notification after a peer is removed.
pub type DisconnectCallback = Arc<dyn Fn(String) + Send + Sync>;

#[derive(thiserror::Error, Debug)]
pub enum PublishError {
    #[error(transparent)]
    Encode(#[from] CodecError),
    #[error("message schema does not match the advertised topic type")]
    WrongMessageType,
    #[error("subscriber \"{0}\" cannot keep up, outbound queue is full")]
    SlowSubscriber(String),
    #[error("publication is shut down")]
    Closed,
}

/// Control messages accepted by a publication's worker loop.
pub enum PublicationMsg {
    /// Broadcast; slow peers lose the frame (logged).
    Publish { body: Bytes },
    /// Broadcast, reporting the first saturated peer instead of dropping
    /// silently. Peers with queue space still receive the frame.
    TryPublish {
        body: Bytes,
        reply: oneshot::Sender<Result<(), PublishError>>,
    },
    /// An inbound subscriber connection routed here by the node listener.
    Accept {
        stream: TcpStream,
        raw_header: RawHeader,
    },
    SubscriberIds {
        reply: oneshot::Sender<BTreeSet<String>>,
    },
    AdmitPeer {
        peer: Peer,
    },
    PeerClosed {
        caller_id: String,
        seat: u64,
    },
}

pub struct Peer {
    seat: u64,
    caller_id: String,
    frame_tx: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
}

/// One advertised topic: the subscriber peer table, the latched slot, and
/// the worker loop fanning published frames out to every peer.
pub struct Publication {
    topic: Topic,
    control_tx: mpsc::Sender<PublicationMsg>,
    cancel_token: CancellationToken,
    task: JoinHandle<()>,
}

pub struct PublicationOptions {
    pub queue_size: usize,
    pub latching: bool,
    pub tcp_nodelay: bool,
    pub on_connect: Option<ConnectCallback>,
    pub on_disconnect: Option<DisconnectCallback>,
}

impl Publication {
    pub fn new(topic_name: &str, msg_type: &MessageType, caller_id: &str, options: PublicationOptions) -> Self {
        let topic = Topic::new(topic_name, msg_type);

        let header_bytes = PublisherHeader {
            caller_id: caller_id.to_string(),
            topic: topic.name.clone(),
            md5sum: topic.spec.md5sum.clone(),
            msg_type: topic.spec.msg_type.clone(),
            latching: options.latching,
        }
        .to_bytes();

        let (control_tx, control_rx) = mpsc::channel(16);
        let cancel_token = CancellationToken::new();

        let worker = PublicationWorker {
            topic: topic.clone(),
            header_bytes: Bytes::from(header_bytes),
            options,
            control_tx: control_tx.clone(),
            peers: HashMap::new(),
            latched: None,
            next_seat: 0,
        };

        let span = span!(
            parent: None,
            Level::DEBUG,
            "publication",
            topic = topic.name.clone(),
        );

        let task = tokio::spawn(
            worker
                .run(control_rx, cancel_token.clone())
                .instrument(span),
        );

        Publication {
            topic,
            control_tx,
            cancel_token,
            task,
        }
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    pub fn control(&self) -> mpsc::Sender<PublicationMsg> {
        self.control_tx.clone()
    }

    /// Stop the worker and every peer connection.
    pub async fn shutdown(self) {
        self.cancel_token.cancel();

        if let Err(e) = self.task.await {
            warn!("Publication task did not shut down cleanly: {e}");
        }
    }
}

struct PublicationWorker {
    topic: Topic,
    header_bytes: Bytes,
    options: PublicationOptions,
    control_tx: mpsc::Sender<PublicationMsg>,
    peers: HashMap<String, Peer>,
    latched: Option<Bytes>,
    next_seat: u64,
}

impl PublicationWorker {
    async fn run(
        mut self,
        mut control_rx: mpsc::Receiver<PublicationMsg>,
        cancel_token: CancellationToken,
    ) {
        debug!("Publication loop started");

        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => {
                    trace!("Publication loop stopped by cancel token");
                    break;
                }

                control_msg = control_rx.recv() => {
                    let Some(control_msg) = control_msg else {
                        debug!("Publication control channel closed");
                        break;
                    };

                    self.handle_control(control_msg).await;
                }
            }
        }

        for (_, peer) in std::mem::take(&mut self.peers) {
            peer.cancel.cancel();
        }

        trace!("Publication loop exited");
    }

    async fn handle_control(&mut self, control_msg: PublicationMsg) {
        match control_msg {
            PublicationMsg::Publish { body } => {
                self.broadcast(&body);

                if self.options.latching {
                    self.latched = Some(body);
                }
            }

            PublicationMsg::TryPublish { body, reply } => {
                let result = self.broadcast(&body);

                if self.options.latching {
                    self.latched = Some(body);
                }

                let _ = reply.send(result);
            }

            PublicationMsg::Accept { stream, raw_header } => {
                if let Err(e) = self.accept(stream, raw_header).await {
                    warn!("Failed to set up subscriber connection: {e}");
                }
            }

            PublicationMsg::SubscriberIds { reply } => {
                let _ = reply.send(self.peers.keys().cloned().collect());
            }

            PublicationMsg::AdmitPeer { peer } => {
                trace!("Admitting subscriber \"{}\" to broadcast set", peer.caller_id);

                // A reconnecting subscriber replaces its previous seat.
                if let Some(stale) = self.peers.insert(peer.caller_id.clone(), peer) {
                    stale.cancel.cancel();
                }
            }

            PublicationMsg::PeerClosed { caller_id, seat } => {
                let matches = self
                    .peers
                    .get(&caller_id)
                    .is_some_and(|peer| peer.seat == seat);

                if matches {
                    if let Some(peer) = self.peers.remove(&caller_id) {
                        debug!("Subscriber \"{caller_id}\" disconnected");
                        peer.cancel.cancel();
                    }

                    if let Some(on_disconnect) = &self.options.on_disconnect {
                        let on_disconnect = on_disconnect.clone();
                        tokio::spawn(async move { on_disconnect(caller_id) });
                    }
                }
            }
        }
    }

    /// Enqueue a frame to every admitted peer. Every message is delivered to
    /// all peers with queue space; the first saturated peer is reported.
    fn broadcast(&mut self, body: &Bytes) -> Result<(), PublishError> {
        let mut saturated = None;

        for peer in self.peers.values() {
            match peer.frame_tx.try_send(body.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(
                        "Dropping frame for slow subscriber \"{}\"",
                        peer.caller_id
                    );

                    if saturated.is_none() {
                        saturated = Some(peer.caller_id.clone());
                    }
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    trace!("Peer \"{}\" writer already closed", peer.caller_id);
                }
            }
        }

        match saturated {
            Some(caller_id) => Err(PublishError::SlowSubscriber(caller_id)),
            None => Ok(()),
        }
    }

    /// Handshake with an inbound subscriber, then hand the connection to a
    /// writer/reader task pair. If a connect callback is configured, the
    /// peer joins the broadcast set only once the callback returns.
    async fn accept(&mut self, stream: TcpStream, raw_header: RawHeader) -> Result<(), LinkError> {
        let subscriber_header = SubscriberHeader::from_raw(&raw_header)?;

        if let Err(mismatch) = self
            .topic
            .spec
            .validate_compatibility(&subscriber_header.md5sum, &subscriber_header.msg_type)
        {
            let mut stream = stream;
            let _ = stream.write_all(&header::error_header(&mismatch.to_string())).await;
            return Err(mismatch.into());
        }

        let mut stream = stream;

        if self.options.tcp_nodelay || subscriber_header.tcp_nodelay {
            trace!(
                "Enabling TCP_NODELAY on socket for subscriber \"{}\"",
                subscriber_header.caller_id
            );
            stream.set_nodelay(true)?;
        }

        stream.write_all(&self.header_bytes).await?;

        let caller_id = subscriber_header.caller_id;
        let seat = self.next_seat;
        self.next_seat += 1;

        let (frame_tx, frame_rx) = mpsc::channel::<Bytes>(self.options.queue_size.max(1));
        let cancel = CancellationToken::new();
        let (read_half, write_half) = stream.into_split();

        let span = span!(
            Level::DEBUG,
            "subscriber_peer",
            topic = self.topic.name.clone(),
            subscriber_id = caller_id.clone(),
        );

        tokio::spawn(
            peer_writer_task(write_half, frame_rx, cancel.clone()).instrument(span.clone()),
        );

        {
            let control_tx = self.control_tx.clone();
            let caller_id = caller_id.clone();
            let cancel = cancel.clone();

            tokio::spawn(
                peer_reader_task(read_half, control_tx, caller_id, seat, cancel).instrument(span),
            );
        }

        // A latched publication replays its most recent message to every
        // newly connecting subscriber.
        if let Some(latched) = &self.latched {
            let _ = frame_tx.try_send(latched.clone());
        }

        let peer = Peer {
            seat,
            caller_id: caller_id.clone(),
            frame_tx: frame_tx.clone(),
            cancel,
        };

        match &self.options.on_connect {
            Some(on_connect) => {
                let on_connect = on_connect.clone();
                let control_tx = self.control_tx.clone();
                let single = SingleSubscriberPublisher {
                    topic: self.topic.name.clone(),
                    subscriber_name: caller_id,
                    frame_tx,
                };

                tokio::spawn(async move {
                    on_connect(single).await;

                    if control_tx
                        .send(PublicationMsg::AdmitPeer { peer })
                        .await
                        .is_err()
                    {
                        trace!("Publication gone before connect callback finished");
                    }
                });
            }
            None => {
                self.peers.insert(caller_id, peer);
            }
        }

        Ok(())
    }
}

async fn peer_writer_task(
    mut write_half: OwnedWriteHalf,
    mut frame_rx: mpsc::Receiver<Bytes>,
    cancel: CancellationToken,
) {
    debug!("Peer writer task started");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                trace!("Peer writer stopped by cancel token");
                break;
            }

            frame = frame_rx.recv() => {
                match frame {
                    Some(frame) => {
                        if let Err(e) = write_half.write_all(&frame).await {
                            debug!("Peer write failed: {e}");
                            break;
                        }
                    }
                    None => {
                        trace!("Peer frame channel closed");
                        break;
                    }
                }
            }
        }
    }
}

/// Publishers never expect inbound data; the read side exists purely to
/// notice the subscriber going away.
async fn peer_reader_task(
    mut read_half: OwnedReadHalf,
    control_tx: mpsc::Sender<PublicationMsg>,
    caller_id: String,
    seat: u64,
    cancel: CancellationToken,
) {
    let mut scratch = [0u8; 256];

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,

            read = read_half.read(&mut scratch) => {
                match read {
                    Ok(0) | Err(_) => break,
                    Ok(_) => continue,
                }
            }
        }
    }

    let _ = control_tx
        .send(PublicationMsg::PeerClosed { caller_id, seat })
        .await;
}

/// Publishes to exactly one subscriber; handed to connect callbacks so they
/// can seed a new peer before it sees the regular broadcast stream.
pub struct SingleSubscriberPublisher {
    topic: String,
    subscriber_name: String,
    frame_tx: mpsc::Sender<Bytes>,
}

impl SingleSubscriberPublisher {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn subscriber_name(&self) -> &str {
        &self.subscriber_name
    }

    pub async fn publish(&self, message: &DynamicMessage) -> Result<(), PublishError> {
        let body = message.serialize_vec()?;

        self.frame_tx
            .send(tcpros::frame(&body))
            .await
            .map_err(|_| PublishError::Closed)
    }
}
