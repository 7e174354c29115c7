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
    msg::{DynamicMessage, MessageType},
    tcpros::{
        self,
        publication::{Publication, PublicationMsg, PublicationOptions, PublishError},
        Topic,
    },
    xmlrpc::{ClientError, MasterClient},
};

#[derive(Debug, thiserror::Error)]
pub enum PublisherActorError {
    #[error("master client error: {0}")]
    Master(#[from] ClientError),
    #[error("topic \"{0}\" already has a publisher on this node")]
    AlreadyRegistered(String),
    #[error("publisher registry unavailable: {0}")]
    Registry(String),
}

pub type PublisherActorResult<T> = Result<T, PublisherActorError>;

pub enum PublisherActorMsg {
    Register {
        topic_name: String,
        msg_type: MessageType,
        caller_id: String,
        options: PublicationOptions,
        reply: RpcReplyPort<PublisherActorResult<Publisher>>,
    },
    Unregister {
        topic_name: String,
        reply: RpcReplyPort<PublisherActorResult<()>>,
    },
    Drop {
        topic_name: String,
    },
    /// Look up the publication worker for an inbound subscriber connection
    /// or a `requestTopic` slave call.
    Lookup {
        topic_name: String,
        reply: RpcReplyPort<Option<mpsc::Sender<PublicationMsg>>>,
    },
    GetPublications {
        reply: RpcReplyPort<Vec<(String, String)>>,
    },
    ConnectedSubscriberIds {
        topic_name: String,
        reply: RpcReplyPort<Option<BTreeSet<String>>>,
    },
}

pub struct PublisherActorState {
    master_client: MasterClient,
    publications: HashMap<String, (Weak<PublisherGuard>, Publication)>,
}

impl PublisherActorState {
    pub fn new(master_client: &MasterClient) -> Self {
        Self {
            master_client: master_client.clone(),
            publications: HashMap::new(),
        }
    }
}

pub struct PublisherActor;

impl Actor for PublisherActor {
    type Msg = PublisherActorMsg;
    type State = PublisherActorState;
    type Arguments = PublisherActorState;

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
        for (topic_name, (guard, publication)) in std::mem::take(&mut state.publications) {
            if let Err(e) = Self::cleanup_publication(state, guard, publication).await {
                warn!("Failed to clean up publication: [topic: \"{topic_name}\", error: \"{e}\"]");
            }
        }

        trace!("Publisher registry shutdown complete");
        Ok(())
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ractor::ActorProcessingErr> {
        match message {
            PublisherActorMsg::Register {
                topic_name,
                msg_type,
                caller_id,
                options,
                reply,
            } => {
                reply.send(
                    Self::register(state, myself, topic_name, msg_type, caller_id, options).await,
                )?;
            }

            PublisherActorMsg::Unregister { topic_name, reply } => {
                reply.send(Self::unregister(state, topic_name).await)?;
            }

            PublisherActorMsg::Drop { topic_name } => {
                if let Err(e) = Self::unregister(state, topic_name).await {
                    warn!("Encountered an error while handling drop guard message: {e}");
                }
            }

            PublisherActorMsg::Lookup { topic_name, reply } => {
                let publication = state
                    .publications
                    .get(&topic_name)
                    .map(|(_, publication)| publication.control());

                reply.send(publication)?;
            }

            PublisherActorMsg::GetPublications { reply } => {
                let publications = state
                    .publications
                    .iter()
                    .map(|(topic_name, (_, publication))| {
                        (topic_name.clone(), publication.topic().spec.msg_type.clone())
                    })
                    .collect();

                reply.send(publications)?;
            }

            PublisherActorMsg::ConnectedSubscriberIds { topic_name, reply } => {
                reply.send(Self::connected_subscriber_ids(state, topic_name).await)?;
            }
        }

        Ok(())
    }
}

impl PublisherActor {
    async fn cleanup_publication(
        state: &PublisherActorState,
        guard: Weak<PublisherGuard>,
        publication: Publication,
    ) -> PublisherActorResult<()> {
        if let Some(guard) = guard.upgrade() {
            guard.disarm();
        }

        let topic_name = publication.topic().name.clone();
        publication.shutdown().await;

        state.master_client.unregister_publisher(&topic_name).await?;
        Ok(())
    }

    #[instrument(skip_all, fields(topic_name = topic_name))]
    async fn register(
        state: &mut PublisherActorState,
        actor_ref: ActorRef<PublisherActorMsg>,
        topic_name: String,
        msg_type: MessageType,
        caller_id: String,
        options: PublicationOptions,
    ) -> PublisherActorResult<Publisher> {
        trace!("Register called");

        if let Entry::Occupied(entry) = state.publications.entry(topic_name.clone()) {
            let (guard, _) = entry.get();

            // One publisher per topic per node; only a stale entry whose
            // handles are all gone may be replaced.
            if guard.upgrade().is_some() {
                return Err(PublisherActorError::AlreadyRegistered(topic_name));
            }

            warn!("Stale publication found in registry");

            let (guard, publication) = entry.remove();
            if let Err(e) = Self::cleanup_publication(state, guard, publication).await {
                warn!("Failed to clean up stale publication: {e}");
            }
        }

        let publication = Publication::new(&topic_name, &msg_type, &caller_id, options);
        let topic = publication.topic().clone();

        let existing_subscribers = match state
            .master_client
            .register_publisher(&topic.name, &topic.spec.msg_type)
            .await
        {
            Ok(subscribers) => subscribers,
            Err(e) => {
                publication.shutdown().await;
                return Err(e.into());
            }
        };

        debug!("Found {} existing subscriber(s)", existing_subscribers.len());

        let guard = Arc::new(PublisherGuard::new(&topic.name, &actor_ref));
        let control_tx = publication.control();

        state
            .publications
            .insert(topic.name.clone(), (Arc::downgrade(&guard), publication));

        Ok(Publisher {
            topic,
            msg_type,
            control_tx,
            _guard: guard,
        })
    }

    #[instrument(skip(state))]
    async fn unregister(
        state: &mut PublisherActorState,
        topic_name: String,
    ) -> PublisherActorResult<()> {
        trace!("Unregister called");

        if let Some((guard, publication)) = state.publications.remove(&topic_name) {
            Self::cleanup_publication(state, guard, publication).await?;
        }

        Ok(())
    }

    #[instrument(skip(state))]
    async fn connected_subscriber_ids(
        state: &mut PublisherActorState,
        topic_name: String,
    ) -> Option<BTreeSet<String>> {
        trace!("ConnectedSubscriberIds called");

        let (_, publication) = state.publications.get(&topic_name)?;

        let (reply_tx, reply_rx) = oneshot::channel();
        publication
            .control()
            .send(PublicationMsg::SubscriberIds { reply: reply_tx })
            .await
            .ok()?;

        reply_rx.await.ok()
    }
}

/// Handle to one advertised topic.
///
/// The underlying publication is unregistered once every handle is dropped
/// or [`Publisher::shutdown`] is called.
#[derive(Clone)]
pub struct Publisher {
    topic: Topic,
    msg_type: MessageType,
    control_tx: mpsc::Sender<PublicationMsg>,
    _guard: Arc<PublisherGuard>,
}

impl Publisher {
    pub fn topic_name(&self) -> &str {
        &self.topic.name
    }

    fn encode(&self, message: &DynamicMessage) -> Result<bytes::Bytes, PublishError> {
        if message.schema() != self.msg_type.schema().as_ref() {
            return Err(PublishError::WrongMessageType);
        }

        Ok(tcpros::frame(&message.serialize_vec()?))
    }

    /// Serialize once and enqueue onto every connected subscriber. Slow
    /// subscribers lose the frame (logged by the publication worker).
    pub async fn publish(&self, message: &DynamicMessage) -> Result<(), PublishError> {
        let body = self.encode(message)?;

        self.control_tx
            .send(PublicationMsg::Publish { body })
            .await
            .map_err(|_| PublishError::Closed)
    }

    /// Like [`publish`](Self::publish), but reports the first subscriber
    /// whose queue was saturated instead of silently dropping.
    pub async fn try_publish(&self, message: &DynamicMessage) -> Result<(), PublishError> {
        let body = self.encode(message)?;
        let (reply_tx, reply_rx) = oneshot::channel();

        self.control_tx
            .send(PublicationMsg::TryPublish {
                body,
                reply: reply_tx,
            })
            .await
            .map_err(|_| PublishError::Closed)?;

        reply_rx.await.map_err(|_| PublishError::Closed)?
    }

    pub async fn subscriber_ids(&self) -> BTreeSet<String> {
        let (reply_tx, reply_rx) = oneshot::channel();

        if self
            .control_tx
            .send(PublicationMsg::SubscriberIds { reply: reply_tx })
            .await
            .is_err()
        {
            return BTreeSet::new();
        }

        reply_rx.await.unwrap_or_default()
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscriber_ids().await.len()
    }

    /// Unregister the publication. Further `publish` calls on any handle
    /// will fail with `Closed`. Idempotent.
    pub async fn shutdown(&self) -> Result<(), PublisherActorError> {
        self._guard.disarm();

        ractor::call!(&self._guard.actor_ref, |reply| {
            PublisherActorMsg::Unregister {
                topic_name: self.topic.name.clone(),
                reply,
            }
        })
        .map_err(|e| PublisherActorError::Registry(e.to_string()))?
    }
}

pub struct PublisherGuard {
    topic_name: String,
    armed: AtomicBool,
    actor_ref: ActorRef<PublisherActorMsg>,
}

impl PublisherGuard {
    fn new(topic_name: &str, actor_ref: &ActorRef<PublisherActorMsg>) -> Self {
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

impl Drop for PublisherGuard {
    fn drop(&mut self) {
        if self.armed.load(Ordering::Acquire) {
            if let Err(e) = cast!(
                &self.actor_ref,
                PublisherActorMsg::Drop {
                    topic_name: self.topic_name.clone(),
                }
            ) {
                warn!(
                    "Failed to trigger publication cleanup: [topic: \"{}\", error: \"{e}\"]",
                    self.topic_name
                );
            }
        }
    }
}
