use std::{collections::BTreeMap, collections::BTreeSet, io, sync::Arc};

use bytes::Bytes;
use futures_util::future::BoxFuture;
use tokio::{
    io::AsyncWriteExt,
    net::TcpStream,
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, span, trace, warn, Instrument, Level};
use url::Url;

use crate::{
    dispatch::JobQueue,
    msg::{DynamicMessage, MessageType},
    tcpros::{
        self,
        header::{PublisherHeader, RawHeader, SubscriberHeader},
        LinkError, MessageEvent, Topic, TopicSpec,
    },
    time::Time,
    xmlrpc::{ClientError, SlaveClient},
};

/// How a child link opens its TCP connection. Injected so tests can splice
/// in an in-memory transport instead of a live publisher.
pub type Dialer = Arc<dyn Fn(String) -> BoxFuture<'static, io::Result<TcpStream>> + Send + Sync>;

pub fn tcp_dialer() -> Dialer {
    Arc::new(|addr| Box::pin(async move { TcpStream::connect(addr).await }))
}

/// One registered user callback. The closed set of shapes replaces
/// arity-sniffing: callers pick the data they want at registration time.
#[derive(Clone)]
pub enum MessageCallback {
    Message(Arc<dyn Fn(DynamicMessage) + Send + Sync>),
    MessageWithEvent(Arc<dyn Fn(DynamicMessage, MessageEvent) + Send + Sync>),
    EventOnly(Arc<dyn Fn(MessageEvent) + Send + Sync>),
}

impl MessageCallback {
    pub fn message(callback: impl Fn(DynamicMessage) + Send + Sync + 'static) -> Self {
        MessageCallback::Message(Arc::new(callback))
    }

    pub fn message_with_event(
        callback: impl Fn(DynamicMessage, MessageEvent) + Send + Sync + 'static,
    ) -> Self {
        MessageCallback::MessageWithEvent(Arc::new(callback))
    }

    pub fn event_only(callback: impl Fn(MessageEvent) + Send + Sync + 'static) -> Self {
        MessageCallback::EventOnly(Arc::new(callback))
    }

    fn invoke(&self, message: &DynamicMessage, event: &MessageEvent) {
        match self {
            MessageCallback::Message(callback) => callback(message.clone()),
            MessageCallback::MessageWithEvent(callback) => {
                callback(message.clone(), event.clone())
            }
            MessageCallback::EventOnly(callback) => callback(event.clone()),
        }
    }
}

/// Control messages accepted by a subscription's multiplex loop.
pub enum SubscriptionMsg {
    UpdatePublishers(BTreeSet<String>),
    AddCallback(MessageCallback),
    PublisherCount(oneshot::Sender<usize>),
    ConnectedPublishers(oneshot::Sender<BTreeSet<String>>),
}

struct InboundMessage {
    payload: Bytes,
    event: MessageEvent,
}

/// One topic subscription: the set of live publisher links plus the loop
/// that multiplexes list updates, inbound frames, disconnects, callback
/// registration, and shutdown.
pub struct Subscription {
    topic: Topic,
    control_tx: mpsc::Sender<SubscriptionMsg>,
    cancel_token: CancellationToken,
    task: JoinHandle<()>,
}

impl Subscription {
    pub fn new(
        topic_name: &str,
        msg_type: MessageType,
        caller_id: &str,
        tcp_nodelay: bool,
        dialer: Dialer,
        job_queue: JobQueue,
        callback: MessageCallback,
    ) -> Self {
        let topic = Topic::new(topic_name, &msg_type);

        let header_bytes = SubscriberHeader {
            caller_id: caller_id.to_string(),
            topic: topic.name.clone(),
            md5sum: topic.spec.md5sum.clone(),
            msg_type: topic.spec.msg_type.clone(),
            msg_definition: topic.spec.msg_definition.clone(),
            tcp_nodelay,
        }
        .to_bytes();

        let (control_tx, control_rx) = mpsc::channel(10);
        let cancel_token = CancellationToken::new();

        let worker = SubscriptionWorker {
            topic: topic.clone(),
            msg_type,
            caller_id: caller_id.to_string(),
            header_bytes: Bytes::from(header_bytes),
            dialer,
            job_queue,
            callbacks: vec![callback],
            children: BTreeMap::new(),
        };

        let span = span!(
            parent: None,
            Level::DEBUG,
            "subscription",
            topic = topic.name.clone(),
        );

        let task = tokio::spawn(
            worker
                .run(control_rx, cancel_token.clone())
                .instrument(span),
        );

        Subscription {
            topic,
            control_tx,
            cancel_token,
            task,
        }
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    pub fn control(&self) -> mpsc::Sender<SubscriptionMsg> {
        self.control_tx.clone()
    }

    /// Cancel every child link and wait for the loop to acknowledge.
    pub async fn shutdown(self) {
        self.cancel_token.cancel();

        if let Err(e) = self.task.await {
            warn!("Subscription task did not shut down cleanly: {e}");
        }
    }
}

struct ChildLink {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct SubscriptionWorker {
    topic: Topic,
    msg_type: MessageType,
    caller_id: String,
    header_bytes: Bytes,
    dialer: Dialer,
    job_queue: JobQueue,
    callbacks: Vec<MessageCallback>,
    children: BTreeMap<String, ChildLink>,
}

impl SubscriptionWorker {
    async fn run(
        mut self,
        mut control_rx: mpsc::Receiver<SubscriptionMsg>,
        cancel_token: CancellationToken,
    ) {
        debug!("Subscription loop started");

        let (msg_tx, mut msg_rx) = mpsc::channel::<InboundMessage>(10);
        let (disconnect_tx, mut disconnect_rx) = mpsc::channel::<String>(10);

        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => {
                    trace!("Subscription loop stopped by cancel token");
                    break;
                }

                control_msg = control_rx.recv() => {
                    let Some(control_msg) = control_msg else {
                        debug!("Subscription control channel closed");
                        break;
                    };

                    self.handle_control(control_msg, &msg_tx, &disconnect_tx).await;
                }

                inbound = msg_rx.recv() => {
                    // The senders live as long as this loop, so recv cannot
                    // return None here.
                    if let Some(inbound) = inbound {
                        self.dispatch_message(inbound).await;
                    }
                }

                publisher_uri = disconnect_rx.recv() => {
                    if let Some(publisher_uri) = publisher_uri {
                        debug!("Publisher link disconnected: \"{publisher_uri}\"");
                        self.children.remove(&publisher_uri);
                    }
                }
            }
        }

        // Drain: every child must acknowledge before the subscription is
        // considered gone.
        for (publisher_uri, child) in std::mem::take(&mut self.children) {
            child.cancel.cancel();

            if let Err(e) = child.task.await {
                warn!("Publisher link for \"{publisher_uri}\" did not exit cleanly: {e}");
            }
        }

        trace!("Subscription loop exited");
    }

    async fn handle_control(
        &mut self,
        control_msg: SubscriptionMsg,
        msg_tx: &mpsc::Sender<InboundMessage>,
        disconnect_tx: &mpsc::Sender<String>,
    ) {
        match control_msg {
            SubscriptionMsg::UpdatePublishers(publishers) => {
                self.update_publishers(publishers, msg_tx, disconnect_tx)
                    .await;
            }

            SubscriptionMsg::AddCallback(callback) => {
                trace!("Adding callback to subscription");
                self.callbacks.push(callback);
            }

            SubscriptionMsg::PublisherCount(reply) => {
                let _ = reply.send(self.children.len());
            }

            SubscriptionMsg::ConnectedPublishers(reply) => {
                let _ = reply.send(self.children.keys().cloned().collect());
            }
        }
    }

    /// Reconcile the live link set against the master's publisher list:
    /// dead peers are torn down before any new peer is dialed.
    async fn update_publishers(
        &mut self,
        publishers: BTreeSet<String>,
        msg_tx: &mpsc::Sender<InboundMessage>,
        disconnect_tx: &mpsc::Sender<String>,
    ) {
        trace!("Received publisher list update: {publishers:?}");

        let known: BTreeSet<String> = self.children.keys().cloned().collect();

        for dead in known.difference(&publishers) {
            debug!("Tearing down link to removed publisher \"{dead}\"");

            if let Some(child) = self.children.remove(dead) {
                child.cancel.cancel();

                if let Err(e) = child.task.await {
                    warn!("Publisher link for \"{dead}\" did not exit cleanly: {e}");
                }
            }
        }

        for added in publishers.difference(&known) {
            match self.lookup_channel(added).await {
                Ok(Some(channel_addr)) => {
                    debug!(
                        "Starting link to publisher \"{added}\" via \"{channel_addr}\""
                    );
                    self.spawn_child(added, channel_addr, msg_tx, disconnect_tx);
                }
                Ok(None) => {
                    warn!("Publisher \"{added}\" offers no supported transport, skipping");
                }
                Err(e) => {
                    error!("requestTopic to \"{added}\" failed: {e}");
                }
            }
        }
    }

    /// Ask the publisher's slave API for a TCPROS channel.
    async fn lookup_channel(&self, publisher_uri: &str) -> Result<Option<String>, ClientError> {
        let publisher_url = Url::parse(publisher_uri)
            .map_err(|e| ClientError::MalformedResult(e.to_string()))?;

        let publisher_client = SlaveClient::new(&publisher_url, &self.caller_id);

        let protocol_info = publisher_client
            .request_topic::<(String, String, i32)>(
                &self.topic.name,
                vec![vec![String::from("TCPROS")]],
            )
            .await?;

        Ok(match protocol_info {
            Some((name, host, port)) if name == "TCPROS" => Some(format!("{host}:{port}")),
            Some((name, _, _)) => {
                warn!("Publisher selected unsupported protocol \"{name}\"");
                None
            }
            None => None,
        })
    }

    fn spawn_child(
        &mut self,
        publisher_uri: &str,
        channel_addr: String,
        msg_tx: &mpsc::Sender<InboundMessage>,
        disconnect_tx: &mpsc::Sender<String>,
    ) {
        let cancel = CancellationToken::new();

        let span = span!(
            Level::DEBUG,
            "publisher_link",
            topic = self.topic.name.clone(),
            publisher_uri = publisher_uri.to_string(),
            channel_addr = channel_addr.clone(),
        );

        let link = PublisherLink {
            publisher_uri: publisher_uri.to_string(),
            channel_addr,
            spec: self.topic.spec.clone(),
            header_bytes: self.header_bytes.clone(),
            dialer: self.dialer.clone(),
            msg_tx: msg_tx.clone(),
            disconnect_tx: disconnect_tx.clone(),
        };

        let task = tokio::spawn(link.run(cancel.clone()).instrument(span));

        self.children
            .insert(publisher_uri.to_string(), ChildLink { cancel, task });
    }

    /// Snapshot the callback list and push a decode-and-deliver job onto
    /// the node's callback queue. A queue that stays saturated past the
    /// submit budget costs us the frame, not the connection.
    async fn dispatch_message(&self, inbound: InboundMessage) {
        let callbacks = self.callbacks.clone();
        let schema = self.msg_type.schema().clone();
        let topic_name = self.topic.name.clone();

        let job = Box::new(move || {
            let message = match DynamicMessage::deserialize_slice(schema, &inbound.payload) {
                Ok(message) => message,
                Err(e) => {
                    warn!("Dropping undecodable frame on \"{topic_name}\": {e}");
                    return;
                }
            };

            for callback in &callbacks {
                callback.invoke(&message, &inbound.event);
            }
        });

        if let Err(e) = self.job_queue.submit(job).await {
            warn!("Dropping message on \"{}\": {e}", self.topic.name);
        }
    }
}

/// The connection to a single remote publisher.
///
/// Phases: dial, send handshake, receive handshake, stream. Every exit path
/// announces itself on the disconnect channel; the parent never redials —
/// it waits for the master's next `publisherUpdate`.
struct PublisherLink {
    publisher_uri: String,
    channel_addr: String,
    spec: TopicSpec,
    header_bytes: Bytes,
    dialer: Dialer,
    msg_tx: mpsc::Sender<InboundMessage>,
    disconnect_tx: mpsc::Sender<String>,
}

impl PublisherLink {
    async fn run(self, cancel: CancellationToken) {
        debug!("Publisher link started");

        match self.connect_and_stream(&cancel).await {
            Ok(()) => trace!("Publisher link exited"),
            Err(e) => warn!("Publisher link exited with error: {e}"),
        }

        if self.disconnect_tx.try_send(self.publisher_uri.clone()).is_err() {
            trace!("Subscription loop gone, disconnect not delivered");
        }
    }

    async fn connect_and_stream(&self, cancel: &CancellationToken) -> Result<(), LinkError> {
        trace!("Dialing publisher");
        let mut stream = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            stream = (self.dialer)(self.channel_addr.clone()) => stream?,
        };

        trace!("Sending subscriber header");
        stream.write_all(&self.header_bytes).await?;

        trace!("Waiting for publisher header");
        let raw_header = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            raw = RawHeader::from_async_read(&mut stream) => raw?,
        };

        let publisher_header = PublisherHeader::from_raw(&raw_header)?;

        self.spec
            .validate_compatibility(&publisher_header.md5sum, &publisher_header.msg_type)?;

        if publisher_header.latching {
            debug!(
                "Publisher \"{}\" is set to latching mode",
                publisher_header.caller_id
            );
        }

        let connection_header = raw_header.to_map();

        trace!("Entering streaming state");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    trace!("Publisher link stopped by cancel token");
                    return Ok(());
                }

                payload = tcpros::read_tcpros_frame(&mut stream) => {
                    let inbound = InboundMessage {
                        payload: Bytes::from(payload?),
                        event: MessageEvent {
                            publisher_name: publisher_header.caller_id.clone(),
                            receipt_time: Time::now(),
                            connection_header: connection_header.clone(),
                        },
                    };

                    if self.msg_tx.send(inbound).await.is_err() {
                        debug!("Subscription message channel closed");
                        return Ok(());
                    }
                }
            }
        }
    }
}
