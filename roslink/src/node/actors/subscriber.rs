use std::{
    collections::{hash_map::Entry, BTreeSet, HashMap},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
};

use ractor::{cast, Actor, ActorRef, RpcReplyPort};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, instrument, trace, warn};

use crate::{
    dispatch::JobQueue,
    msg::MessageType,
    tcpros::subscription::{Dialer, MessageCallback, Subscription, SubscriptionMsg},
    xmlrpc::{ClientError, MasterClient},
};

#[derive(Debug, thiserror::Error)]
pub enum SubscriberActorError {
    #[error("master client error: {0}")]
    Master(#[from] ClientError),
    #[error("topic \"{0}\" already has a subscriber on this node")]
    AlreadyRegistered(String),
    #[error("subscriber registry unavailable: {0}")]
    Registry(String),
}

pub type SubscriberActorResult<T> = Result<T, SubscriberActorError>;

pub enum SubscriberActorMsg {
    Register {
        topic_name: String,
        msg_type: MessageType,
        caller_id: String,
        tcp_nodelay: bool,
        callback: MessageCallback,
        reply: RpcReplyPort<SubscriberActorResult<Subscriber>>,
    },
    Unregister {
        topic_name: String,
        reply: RpcReplyPort<SubscriberActorResult<()>>,
    },
    Drop {
        topic_name: String,
    },
    /// Routed over from the slave API's `publisherUpdate`.
    UpdateConnectedPublishers {
        topic_name: String,
        publishers: BTreeSet<String>,
    },
    GetSubscriptions {
        reply: RpcReplyPort<Vec<(String, String)>>,
    },
    ConnectedPublisherUris {
        topic_name: String,
        reply: RpcReplyPort<Option<BTreeSet<String>>>,
    },
}

pub struct SubscriberActorState {
    master_client: MasterClient,
    dialer: Dialer,
    job_queue: JobQueue,
    subscriptions: HashMap<String, (Weak<SubscriberGuard>, Subscription)>,
}

impl SubscriberActorState {
    pub fn new(master_client: &MasterClient, dialer: Dialer, job_queue: JobQueue) -> Self {
        Self {
            master_client: master_client.clone(),
            dialer,
            job_queue,
            subscriptions: HashMap::new(),
        }
    }
}

pub struct SubscriberActor;

impl Actor for SubscriberActor {
    type Msg = SubscriberActorMsg;
    type State = SubscriberActorState;
    type Arguments = SubscriberActorState;

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ractor::ActorProcessingErr> {
        Ok(args)
    }

    async fn post_stop(
        &self,
        _myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ractor::ActorProcessingErr> {
        for (topic_name, (guard, subscription)) in std::mem::take(&mut state.subscriptions) {
            if let Err(e) = Self::cleanup_subscription(state, guard, subscription).await {
                warn!("Failed to clean up subscription: [topic: \"{topic_name}\", error: \"{e}\"]");
            }
        }

        trace!("Subscriber registry shutdown complete");
        Ok(())
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ractor::ActorProcessingErr> {
        match message {
            SubscriberActorMsg::Register {
                topic_name,
                msg_type,
                caller_id,
                tcp_nodelay,
                callback,
                reply,
            } => {
                reply.send(
                    Self::register(
                        state,
                        myself,
                        topic_name,
                        msg_type,
                        caller_id,
                        tcp_nodelay,
                        callback,
                    )
                    .await,
                )?;
            }

            SubscriberActorMsg::Unregister { topic_name, reply } => {
                reply.send(Self::unregister(state, topic_name).await)?;
            }

            SubscriberActorMsg::Drop { topic_name } => {
                if let Err(e) = Self::unregister(state, topic_name).await {
                    warn!("Encountered an error while handling drop guard message: {e}");
                }
            }

            SubscriberActorMsg::UpdateConnectedPublishers {
                topic_name,
                publishers,
            } => {
                if let Some((_, subscription)) = state.subscriptions.get(&topic_name) {
                    let _ = subscription
                        .control()
                        .send(SubscriptionMsg::UpdatePublishers(publishers))
                        .await;
                } else {
                    trace!("publisherUpdate for unknown topic \"{topic_name}\"");
                }
            }

            SubscriberActorMsg::GetSubscriptions { reply } => {
                let subscriptions = state
                    .subscriptions
                    .iter()
                    .map(|(topic_name, (_, subscription))| {
                        (
                            topic_name.clone(),
                            subscription.topic().spec.msg_type.clone(),
                        )
                    })
                    .collect();

                reply.send(subscriptions)?;
            }

            SubscriberActorMsg::ConnectedPublisherUris { topic_name, reply } => {
                reply.send(Self::connected_publisher_uris(state, topic_name).await)?;
            }
        }

        Ok(())
    }
}

impl SubscriberActor {
    async fn cleanup_subscription(
        state: &SubscriberActorState,
        guard: Weak<SubscriberGuard>,
        subscription: Subscription,
    ) -> SubscriberActorResult<()> {
        if let Some(guard) = guard.upgrade() {
            guard.disarm();
        }

        let topic_name = subscription.topic().name.clone();

        trace!("Cleaning up subscription for topic \"{topic_name}\"");

        // Children acknowledge cancellation before the master registration
        // goes away.
        subscription.shutdown().await;

        state
            .master_client
            .unregister_subscriber(&topic_name)
            .await?;

        Ok(())
    }

    #[instrument(skip_all, fields(topic_name = topic_name))]
    async fn register(
        state: &mut SubscriberActorState,
        actor_ref: ActorRef<SubscriberActorMsg>,
        topic_name: String,
        msg_type: MessageType,
        caller_id: String,
        tcp_nodelay: bool,
        callback: MessageCallback,
    ) -> SubscriberActorResult<Subscriber> {
        trace!("Register called");

        if let Entry::Occupied(entry) = state.subscriptions.entry(topic_name.clone()) {
            let (guard, _) = entry.get();

            if guard.upgrade().is_some() {
                return Err(SubscriberActorError::AlreadyRegistered(topic_name));
            }

            warn!("Stale subscription found in registry");

            let (guard, subscription) = entry.remove();
            if let Err(e) = Self::cleanup_subscription(state, guard, subscription).await {
                warn!("Failed to clean up stale subscription: {e}");
            }
        }

        let subscription = Subscription::new(
            &topic_name,
            msg_type,
            &caller_id,
            tcp_nodelay,
            state.dialer.clone(),
            state.job_queue.clone(),
            callback,
        );

        let existing_publishers = match state
            .master_client
            .register_subscriber(&topic_name, &subscription.topic().spec.msg_type)
            .await
        {
            Ok(publishers) => publishers,
            Err(e) => {
                subscription.shutdown().await;
                return Err(e.into());
            }
        };

        debug!("Found {} existing publisher(s)", existing_publishers.len());

        let _ = subscription
            .control()
            .send(SubscriptionMsg::UpdatePublishers(
                existing_publishers.into_iter().collect(),
            ))
            .await;

        let guard = Arc::new(SubscriberGuard::new(&topic_name, &actor_ref));
        let control_tx = subscription.control();
        let topic = subscription.topic().clone();

        state
            .subscriptions
            .insert(topic_name, (Arc::downgrade(&guard), subscription));

        Ok(Subscriber {
            topic,
            control_tx,
            _guard: guard,
        })
    }

    #[instrument(skip(state))]
    async fn unregister(
        state: &mut SubscriberActorState,
        topic_name: String,
    ) -> SubscriberActorResult<()> {
        trace!("Unregister called");

        if let Some((guard, subscription)) = state.subscriptions.remove(&topic_name) {
            Self::cleanup_subscription(state, guard, subscription).await?;
        }

        Ok(())
    }

    #[instrument(skip(state))]
    async fn connected_publisher_uris(
        state: &mut SubscriberActorState,
        topic_name: String,
    ) -> Option<BTreeSet<String>> {
        trace!("ConnectedPublisherUris called");

        let (_, subscription) = state.subscriptions.get(&topic_name)?;

        let (reply_tx, reply_rx) = oneshot::channel();
        subscription
            .control()
            .send(SubscriptionMsg::ConnectedPublishers(reply_tx))
            .await
            .ok()?;

        reply_rx.await.ok()
    }
}

/// Handle to one topic subscription.
///
/// The subscription is torn down and unregistered from the master once
/// every handle is dropped or [`Subscriber::shutdown`] is called.
#[derive(Clone)]
pub struct Subscriber {
    topic: crate::tcpros::Topic,
    control_tx: mpsc::Sender<SubscriptionMsg>,
    _guard: Arc<SubscriberGuard>,
}

impl Subscriber {
    pub fn topic_name(&self) -> &str {
        &self.topic.name
    }

    /// Register another callback; it sees every message that arrives after
    /// registration.
    pub async fn add_callback(&self, callback: MessageCallback) {
        let _ = self
            .control_tx
            .send(SubscriptionMsg::AddCallback(callback))
            .await;
    }

    pub async fn publisher_count(&self) -> usize {
        let (reply_tx, reply_rx) = oneshot::channel();

        if self
            .control_tx
            .send(SubscriptionMsg::PublisherCount(reply_tx))
            .await
            .is_err()
        {
            return 0;
        }

        reply_rx.await.unwrap_or(0)
    }

    pub async fn connected_publisher_uris(&self) -> BTreeSet<String> {
        let (reply_tx, reply_rx) = oneshot::channel();

        if self
            .control_tx
            .send(SubscriptionMsg::ConnectedPublishers(reply_tx))
            .await
            .is_err()
        {
            return BTreeSet::new();
        }

        reply_rx.await.unwrap_or_default()
    }

    /// Tear down the subscription: every child link is cancelled and
    /// acknowledged, then the node unregisters from the master. Idempotent.
    pub async fn shutdown(&self) -> Result<(), SubscriberActorError> {
        self._guard.disarm();

        ractor::call!(&self._guard.actor_ref, |reply| {
            SubscriberActorMsg::Unregister {
                topic_name: self.topic.name.clone(),
                reply,
            }
        })
        .map_err(|e| SubscriberActorError::Registry(e.to_string()))?
    }
}

pub struct SubscriberGuard {
    topic_name: String,
    armed: AtomicBool,
    actor_ref: ActorRef<SubscriberActorMsg>,
}

impl SubscriberGuard {
    fn new(topic_name: &str, actor_ref: &ActorRef<SubscriberActorMsg>) -> Self {
        Self {
            topic_name: topic_name.to_string(),
            armed: AtomicBool::new(true),
            actor_ref: actor_ref.clone(),
        }
    }

    fn disarm(&self) {
        self.armed.store(false, Ordering::Release);
    }
}

impl Drop for SubscriberGuard {
    fn drop(&mut self) {
        if self.armed.load(Ordering::Acquire) {
            if let Err(e) = cast!(
                &self.actor_ref,
                SubscriberActorMsg::Drop {
                    topic_name: self.topic_name.clone(),
                }
            ) {
                warn!(
                    "Failed to trigger subscription cleanup: [topic: \"{}\", error: \"{e}\"]",
                    self.topic_name
                );
            }
        }
    }
}
