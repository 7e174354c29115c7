use std::{
    collections::{BTreeSet, HashMap},
    future::Future,
    net::SocketAddr,
    sync::Arc,
};

use async_shutdown::{ShutdownComplete, ShutdownManager};
use async_trait::async_trait;
use dxr::{TryFromValue, TryToValue};
use futures_util::FutureExt;
use ractor::{call, Actor, ActorRef};
use tokio::{net::TcpListener, sync::mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use url::Url;

mod actors;
mod api;
mod error;

pub mod args;
pub mod builder;

use crate::{
    action::GoalIdGenerator,
    dispatch::{JobQueue, JobRunner},
    msg::{DynamicMessage, MessageType},
    node::{
        actors::{
            parameter::{ParameterActor, ParameterActorMsg, ParameterActorState},
            publisher::{PublisherActor, PublisherActorMsg, PublisherActorState},
            service::{ServiceActor, ServiceActorMsg, ServiceActorState},
            subscriber::{SubscriberActor, SubscriberActorMsg, SubscriberActorState},
        },
        api::{router, server::Server},
        args::NameResolver,
    },
    tcpros::{
        self,
        listener::ConnectionRouter,
        publication::{
            ConnectCallback, DisconnectCallback, PublicationMsg, PublicationOptions,
            SingleSubscriberPublisher,
        },
        service::{server::ServiceServerMsg, ServiceType},
        subscription::{Dialer, MessageCallback},
    },
    xmlrpc::{MasterClient, SystemState},
};

pub use {
    actors::{
        parameter::ParameterActorError,
        publisher::{Publisher, PublisherActorError},
        service::{ServiceActorError, ServiceClient, ServiceServer},
        subscriber::{Subscriber, SubscriberActorError},
    },
    error::NodeError,
};

type NodeResult<T> = Result<T, NodeError>;

/// Depth of the node's callback queue. Producers that cannot place a job
/// within the submit budget drop the message instead.
const JOB_QUEUE_DEPTH: usize = 128;

/// A named participant in a ROS1 graph.
///
/// Cloning is cheap; all clones point at the same underlying node.
#[derive(Clone)]
pub struct Node {
    state: Arc<NodeState>,
}

pub struct NodeState {
    pub(crate) name: String,
    pub(crate) resolver: NameResolver,
    pub(crate) advertised_host: String,
    pub(crate) address: SocketAddr,
    pub(crate) tcpros_address: SocketAddr,
    pub(crate) api_url: Url,
    pub(crate) master_url: Url,
    pub(crate) master_client: MasterClient,
    pub(crate) non_ros_args: Vec<String>,
    pub(crate) log_dir: Option<String>,
    pub(crate) pub_actor: ActorRef<PublisherActorMsg>,
    pub(crate) sub_actor: ActorRef<SubscriberActorMsg>,
    pub(crate) param_actor: ActorRef<ParameterActorMsg>,
    pub(crate) svc_actor: ActorRef<ServiceActorMsg>,
    pub(crate) job_queue: JobQueue,
    pub(crate) job_runner: JobRunner,
    pub(crate) goal_ids: GoalIdGenerator,
    pub(crate) shutdown_mgr: ShutdownManager<Option<String>>,
    pub(crate) spin_cancel: CancellationToken,
}

/// Routes inbound TCPROS connections to the owning publication or service.
struct ActorConnectionRouter {
    pub_actor: ActorRef<PublisherActorMsg>,
    svc_actor: ActorRef<ServiceActorMsg>,
}

#[async_trait]
impl ConnectionRouter for ActorConnectionRouter {
    async fn route_topic(&self, topic: &str) -> Option<mpsc::Sender<PublicationMsg>> {
        call!(self.pub_actor, |reply| PublisherActorMsg::Lookup {
            topic_name: topic.to_string(),
            reply,
        })
        .ok()
        .flatten()
    }

    async fn route_service(&self, service: &str) -> Option<mpsc::Sender<ServiceServerMsg>> {
        call!(self.svc_actor, |reply| ServiceActorMsg::Lookup {
            service_name: service.to_string(),
            reply,
        })
        .ok()
        .flatten()
    }
}

impl Node {
    /// Construct a node from a name and `argv`-style arguments, applying
    /// the ROS1 remapping conventions (`a:=b`, `__name`, `__ns`,
    /// `__master`, `__ip`, `__hostname`, `__log`).
    pub async fn new<I, S>(name: &str, args: I) -> NodeResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        builder::NodeBuilder::from_args(name, args).build().await
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn from_parts(
        resolver: NameResolver,
        advertised_host: String,
        api_listener: TcpListener,
        tcpros_listener: TcpListener,
        master_url: Url,
        dialer: Dialer,
        non_ros_args: Vec<String>,
        log_dir: Option<String>,
    ) -> NodeResult<Self> {
        let name = resolver.node_name().to_string();
        let address = api_listener.local_addr()?;
        let tcpros_address = tcpros_listener.local_addr()?;

        let api_url = Url::parse(&format!("http://{}:{}", advertised_host, address.port()))?;

        info!(
            "Launching node: [name: \"{name}\", url: \"{api_url}\", bound_addr: \"{address}\", master_url: \"{master_url}\"]"
        );

        let master_client = MasterClient::new(&master_url, &name, api_url.to_string());

        // Fail fast when the registry cannot be reached; the host program
        // decides what exit code that is worth.
        if !master_client.ping().await {
            return Err(NodeError::MasterUnreachable(master_url.to_string()));
        }

        let (job_queue, job_runner) = crate::dispatch::job_channel(JOB_QUEUE_DEPTH);

        let (pub_actor, _) = Actor::spawn(
            None,
            PublisherActor,
            PublisherActorState::new(&master_client),
        )
        .await?;

        let (sub_actor, _) = Actor::spawn(
            None,
            SubscriberActor,
            SubscriberActorState::new(&master_client, dialer, job_queue.clone()),
        )
        .await?;

        let (param_actor, _) = Actor::spawn(
            None,
            ParameterActor,
            ParameterActorState::new(&master_client),
        )
        .await?;

        let (svc_actor, _) =
            Actor::spawn(None, ServiceActor, ServiceActorState::new(&master_client)).await?;

        let actor_cells = vec![
            pub_actor.get_cell(),
            sub_actor.get_cell(),
            svc_actor.get_cell(),
            param_actor.get_cell(),
        ];

        let shutdown_mgr = ShutdownManager::new();
        let spin_cancel = CancellationToken::new();
        let goal_ids = GoalIdGenerator::new(&name);

        let state = Arc::new(NodeState {
            name,
            resolver,
            advertised_host,
            address,
            tcpros_address,
            api_url,
            master_url,
            master_client,
            non_ros_args,
            log_dir,
            pub_actor: pub_actor.clone(),
            sub_actor: sub_actor.clone(),
            param_actor,
            svc_actor: svc_actor.clone(),
            job_queue,
            job_runner,
            goal_ids,
            shutdown_mgr: shutdown_mgr.clone(),
            spin_cancel: spin_cancel.clone(),
        });

        let (api_server, api_shutdown_trigger) = Server::new(router::build_router(&state));

        let tcpros_cancel = CancellationToken::new();

        {
            let connection_router = Arc::new(ActorConnectionRouter {
                pub_actor,
                svc_actor,
            });

            tokio::spawn(tcpros::listener::serve(
                tcpros_listener,
                connection_router,
                tcpros_cancel.clone(),
            ));
        }

        tokio::spawn(async move {
            let _shutdown_guard = shutdown_mgr.delay_shutdown_token().ok();

            tokio::select! {
                shutdown_trigger = shutdown_mgr.wait_shutdown_triggered() => {
                    match shutdown_trigger {
                        Some(reason) => info!("Node shutdown requested with reason: \"{reason}\""),
                        None => info!("Node shutdown requested with no reason"),
                    }
                }

                Err(e) = api_server.serve_listener(api_listener) => {
                    error!("Failed to serve XML-RPC API: {e}");
                }
            }

            api_shutdown_trigger.notify_waiters();
            tcpros_cancel.cancel();
            spin_cancel.cancel();

            for actor in actor_cells {
                if let Err(e) = actor.stop_and_wait(None, None).await {
                    warn!(
                        "Failed to stop actor: {}: {e}",
                        actor
                            .get_name()
                            .unwrap_or_else(|| actor.get_id().to_string())
                    );
                }
            }
        });

        Ok(Node { state })
    }

    /// The node's fully-qualified graph name.
    pub fn name(&self) -> &str {
        &self.state.name
    }

    /// The namespace the node resolves relative names in.
    pub fn namespace(&self) -> &str {
        self.state.resolver.namespace()
    }

    /// Resolve a graph name through the node's namespace and remappings.
    pub fn resolve_name(&self, name: &str) -> String {
        self.state.resolver.resolve(name)
    }

    /// Arguments that were not consumed by remapping syntax.
    pub fn non_ros_args(&self) -> &[String] {
        &self.state.non_ros_args
    }

    /// Log directory requested via `__log` or `ROS_LOG_DIR`, if any.
    pub fn log_dir(&self) -> Option<&str> {
        self.state.log_dir.as_deref()
    }

    /// The address the node's slave API is bound to.
    pub fn address(&self) -> &SocketAddr {
        &self.state.address
    }

    /// The address the node's TCPROS listener is bound to.
    pub fn tcpros_address(&self) -> &SocketAddr {
        &self.state.tcpros_address
    }

    /// The node's advertised XML-RPC URL.
    pub fn url(&self) -> &Url {
        &self.state.api_url
    }

    pub fn master_url(&self) -> &Url {
        &self.state.master_url
    }

    pub(crate) fn goal_ids(&self) -> &GoalIdGenerator {
        &self.state.goal_ids
    }

    fn ensure_running(&self) -> NodeResult<()> {
        if self.state.shutdown_mgr.is_shutdown_triggered() {
            return Err(NodeError::NotRunning);
        }

        Ok(())
    }

    /// True until shutdown begins.
    pub fn ok(&self) -> bool {
        !self.state.shutdown_mgr.is_shutdown_triggered()
    }

    /// Run the callback loop until the node shuts down.
    pub async fn spin(&self) {
        self.state
            .job_runner
            .run_until(&self.state.spin_cancel)
            .await;
    }

    /// Process a bounded batch of queued callbacks; returns whether more
    /// work remains.
    pub async fn spin_once(&self) -> bool {
        self.state.job_runner.run_once().await
    }

    /// Trigger a graceful shutdown without waiting for it to complete.
    /// Idempotent.
    pub fn shutdown(&self, reason: Option<String>) -> NodeResult<()> {
        if !self.state.shutdown_mgr.is_shutdown_triggered() {
            self.state.shutdown_mgr.trigger_shutdown(reason)?;
        }

        Ok(())
    }

    /// Trigger a graceful shutdown and wait for every registration to be
    /// cleaned up.
    ///
    /// The master has no mechanism for detecting stale registrations, so
    /// skipping this (e.g. by killing the process) leaves them behind for
    /// the master to deal with.
    pub async fn shutdown_and_wait(self, reason: Option<String>) -> NodeResult<()> {
        self.shutdown(reason)?;
        self.state.shutdown_mgr.wait_shutdown_complete().await;
        Ok(())
    }

    /// A future that resolves once the node has completely shut down.
    pub fn shutdown_complete(&self) -> ShutdownComplete<Option<String>> {
        self.state.shutdown_mgr.wait_shutdown_complete()
    }

    /// Advertise a topic.
    ///
    /// A node holds at most one publisher per topic; a second registration
    /// fails.
    pub async fn advertise(
        &self,
        topic_name: &str,
        msg_type: &MessageType,
        queue_size: usize,
        latched: bool,
        tcp_nodelay: bool,
    ) -> NodeResult<Publisher> {
        self.advertise_inner(
            topic_name,
            msg_type,
            PublicationOptions {
                queue_size,
                latching: latched,
                tcp_nodelay,
                on_connect: None,
                on_disconnect: None,
            },
        )
        .await
    }

    /// Advertise a topic with connect/disconnect callbacks.
    ///
    /// The connect callback runs in its own task with a publisher handle
    /// scoped to the newly connected subscriber; that subscriber joins the
    /// broadcast set only after the callback returns. The disconnect
    /// callback is fire-and-forget.
    pub async fn advertise_with_callbacks<C, Fut, D>(
        &self,
        topic_name: &str,
        msg_type: &MessageType,
        queue_size: usize,
        latched: bool,
        tcp_nodelay: bool,
        on_connect: C,
        on_disconnect: D,
    ) -> NodeResult<Publisher>
    where
        C: Fn(SingleSubscriberPublisher) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
        D: Fn(String) + Send + Sync + 'static,
    {
        let on_connect: ConnectCallback = Arc::new(move |single| on_connect(single).boxed());
        let on_disconnect: DisconnectCallback = Arc::new(on_disconnect);

        self.advertise_inner(
            topic_name,
            msg_type,
            PublicationOptions {
                queue_size,
                latching: latched,
                tcp_nodelay,
                on_connect: Some(on_connect),
                on_disconnect: Some(on_disconnect),
            },
        )
        .await
    }

    async fn advertise_inner(
        &self,
        topic_name: &str,
        msg_type: &MessageType,
        options: PublicationOptions,
    ) -> NodeResult<Publisher> {
        self.ensure_running()?;

        let topic_name = self.resolve_name(topic_name);

        Ok(call!(self.state.pub_actor, |reply| {
            PublisherActorMsg::Register {
                topic_name,
                msg_type: msg_type.clone(),
                caller_id: self.state.name.clone(),
                options,
                reply,
            }
        })??)
    }

    /// Remove the node's publisher for a topic, if one exists.
    pub async fn unadvertise(&self, topic_name: &str) -> NodeResult<()> {
        let topic_name = self.resolve_name(topic_name);

        Ok(call!(self.state.pub_actor, |reply| {
            PublisherActorMsg::Unregister { topic_name, reply }
        })??)
    }

    /// Subscribe to a topic.
    ///
    /// The callback runs on the node's callback loop (`spin`/`spin_once`),
    /// serialized with every other callback of this node. A node holds at
    /// most one subscriber per topic; a second registration fails.
    pub async fn subscribe(
        &self,
        topic_name: &str,
        msg_type: &MessageType,
        tcp_nodelay: bool,
        callback: MessageCallback,
    ) -> NodeResult<Subscriber> {
        self.ensure_running()?;

        let topic_name = self.resolve_name(topic_name);

        Ok(call!(self.state.sub_actor, |reply| {
            SubscriberActorMsg::Register {
                topic_name,
                msg_type: msg_type.clone(),
                caller_id: self.state.name.clone(),
                tcp_nodelay,
                callback,
                reply,
            }
        })??)
    }

    /// Remove the node's subscriber for a topic, if one exists.
    pub async fn unsubscribe(&self, topic_name: &str) -> NodeResult<()> {
        let topic_name = self.resolve_name(topic_name);

        Ok(call!(self.state.sub_actor, |reply| {
            SubscriberActorMsg::Unregister { topic_name, reply }
        })??)
    }

    /// Topics this node publishes, with their types.
    pub async fn get_publications(&self) -> NodeResult<Vec<(String, String)>> {
        Ok(call!(self.state.pub_actor, |reply| {
            PublisherActorMsg::GetPublications { reply }
        })?)
    }

    /// Topics this node subscribes to, with their types.
    pub async fn get_subscriptions(&self) -> NodeResult<Vec<(String, String)>> {
        Ok(call!(self.state.sub_actor, |reply| {
            SubscriberActorMsg::GetSubscriptions { reply }
        })?)
    }

    /// Caller IDs of subscribers connected to one of our publications.
    pub async fn get_connected_subscriber_ids(
        &self,
        topic_name: &str,
    ) -> NodeResult<Option<BTreeSet<String>>> {
        let topic_name = self.resolve_name(topic_name);

        Ok(call!(self.state.pub_actor, |reply| {
            PublisherActorMsg::ConnectedSubscriberIds { topic_name, reply }
        })?)
    }

    /// XML-RPC URIs of publishers feeding one of our subscriptions.
    pub async fn get_connected_publisher_uris(
        &self,
        topic_name: &str,
    ) -> NodeResult<Option<BTreeSet<String>>> {
        let topic_name = self.resolve_name(topic_name);

        Ok(call!(self.state.sub_actor, |reply| {
            SubscriberActorMsg::ConnectedPublisherUris { topic_name, reply }
        })?)
    }

    /// Advertise a service.
    ///
    /// Services are for operations that terminate quickly; use an action
    /// for anything long-running.
    pub async fn advertise_service<F, Fut>(
        &self,
        service_name: &str,
        srv_type: &ServiceType,
        callback: F,
    ) -> NodeResult<ServiceServer>
    where
        F: Fn(DynamicMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<DynamicMessage, String>> + Send + 'static,
    {
        self.ensure_running()?;

        let service_name = self.resolve_name(service_name);
        let service_api = format!(
            "rosrpc://{}:{}",
            self.state.advertised_host,
            self.state.tcpros_address.port()
        );

        let callback = Arc::new(move |request: DynamicMessage| callback(request).boxed());

        Ok(call!(self.state.svc_actor, |reply| {
            ServiceActorMsg::Register {
                service_name,
                srv_type: srv_type.clone(),
                caller_id: self.state.name.clone(),
                service_api,
                callback,
                reply,
            }
        })??)
    }

    /// Create a client for a remote service.
    pub fn service_client(
        &self,
        service_name: &str,
        srv_type: &ServiceType,
        persistent: bool,
    ) -> NodeResult<ServiceClient> {
        self.ensure_running()?;

        let service_name = self.resolve_name(service_name);

        Ok(ServiceClient::new(
            crate::tcpros::service::client::ServiceClientLink::new(
                &service_name,
                srv_type.clone(),
                &self.state.name,
                persistent,
                self.state.master_client.clone(),
            ),
        ))
    }

    /// Services this node advertises, with their types.
    pub async fn get_services(&self) -> NodeResult<Vec<(String, String)>> {
        Ok(call!(self.state.svc_actor, |reply| {
            ServiceActorMsg::GetServices { reply }
        })?)
    }

    /// Get a parameter from the parameter server.
    pub async fn get_param<T: TryFromValue>(&self, name: &str) -> NodeResult<Option<T>> {
        let raw_param = call!(self.state.param_actor, |reply| {
            ParameterActorMsg::Get {
                name: self.resolve_name(name),
                reply,
            }
        })??;

        Ok(raw_param
            .map(|param| T::try_from_value(&param))
            .transpose()
            .map_err(|e| NodeError::Master(crate::xmlrpc::ClientError::from(e)))?)
    }

    /// Get a parameter, subscribing to future updates and caching the
    /// value locally.
    pub async fn get_param_cached<T: TryFromValue>(&self, name: &str) -> NodeResult<Option<T>> {
        let raw_param = call!(self.state.param_actor, |reply| {
            ParameterActorMsg::GetCached {
                name: self.resolve_name(name),
                reply,
            }
        })??;

        Ok(raw_param
            .map(|param| T::try_from_value(&param))
            .transpose()
            .map_err(|e| NodeError::Master(crate::xmlrpc::ClientError::from(e)))?)
    }

    /// Store a parameter on the parameter server.
    pub async fn set_param<T: TryToValue>(&self, name: &str, value: T) -> NodeResult<()> {
        let value = value
            .try_to_value()
            .map_err(|e| NodeError::Master(crate::xmlrpc::ClientError::from(e)))?;

        Ok(call!(self.state.param_actor, |reply| {
            ParameterActorMsg::Set {
                name: self.resolve_name(name),
                value,
                reply,
            }
        })??)
    }

    /// Delete a parameter from the parameter server.
    pub async fn delete_param(&self, name: &str) -> NodeResult<()> {
        Ok(call!(self.state.param_actor, |reply| {
            ParameterActorMsg::Delete {
                name: self.resolve_name(name),
                reply,
            }
        })??)
    }

    /// Check whether a parameter exists.
    pub async fn has_param(&self, name: &str) -> NodeResult<bool> {
        Ok(call!(self.state.param_actor, |reply| {
            ParameterActorMsg::Exists {
                name: self.resolve_name(name),
                reply,
            }
        })??)
    }

    /// Search for a parameter key upwards through parent namespaces.
    pub async fn search_param(&self, name: &str) -> NodeResult<Option<String>> {
        Ok(call!(self.state.param_actor, |reply| {
            ParameterActorMsg::Search {
                name: name.to_string(),
                reply,
            }
        })??)
    }

    /// List every parameter stored on the server.
    pub async fn get_param_names(&self) -> NodeResult<Vec<String>> {
        Ok(call!(self.state.param_actor, |reply| {
            ParameterActorMsg::GetNames { reply }
        })??)
    }

    /// Stop receiving updates for a previously cached parameter.
    pub async fn unsubscribe_param(&self, name: &str) -> NodeResult<()> {
        Ok(call!(self.state.param_actor, |reply| {
            ParameterActorMsg::Unsubscribe {
                name: self.resolve_name(name),
                reply,
            }
        })??)
    }

    /// Snapshot of the whole graph as the master sees it.
    pub async fn get_system_state(&self) -> NodeResult<SystemState> {
        Ok(self.state.master_client.get_system_state().await?)
    }

    /// Topics with at least one publisher, keyed to their types.
    pub async fn get_published_topics(
        &self,
        subgraph: Option<&str>,
    ) -> NodeResult<HashMap<String, String>> {
        Ok(self.state.master_client.get_published_topics(subgraph).await?)
    }

    /// All known topic/type pairs.
    pub async fn get_topic_types(&self) -> NodeResult<HashMap<String, String>> {
        Ok(self.state.master_client.get_topic_types().await?)
    }

    /// The XML-RPC URI of another node, by name.
    pub async fn lookup_node(&self, node_name: &str) -> NodeResult<String> {
        Ok(self.state.master_client.lookup_node(node_name).await?)
    }
}
