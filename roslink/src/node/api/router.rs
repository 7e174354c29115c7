use std::{collections::BTreeSet, process, sync::Arc};

use async_shutdown::ShutdownManager;
use async_trait::async_trait;
use dxr::Value;
use ractor::{call, cast, ActorRef};
use tracing::{trace, warn};
use url::Url;

use crate::node::{
    actors::{
        parameter::ParameterActorMsg, publisher::PublisherActorMsg, subscriber::SubscriberActorMsg,
    },
    api::{
        get_params,
        handler::{invalid_request, server_error, Handler, HandlerResponse, HandlerResult},
        server::RouteBuilder,
    },
    NodeState,
};

pub fn build_router(state: &Arc<NodeState>) -> axum::Router {
    RouteBuilder::new()
        .add_method("getBusStats", Box::new(GetBusStatsHandler))
        .add_method(
            "getBusInfo",
            Box::new(GetBusInfoHandler {
                pub_actor: state.pub_actor.clone(),
                sub_actor: state.sub_actor.clone(),
            }),
        )
        .add_method(
            "getMasterUri",
            Box::new(GetMasterUriHandler {
                master_uri: state.master_url.clone(),
            }),
        )
        .add_method(
            "shutdown",
            Box::new(ShutdownHandler {
                shutdown_mgr: state.shutdown_mgr.clone(),
            }),
        )
        .add_method("getPid", Box::new(GetPidHandler))
        .add_method(
            "getSubscriptions",
            Box::new(GetSubscriptionsHandler {
                sub_actor: state.sub_actor.clone(),
            }),
        )
        .add_method(
            "getPublications",
            Box::new(GetPublicationsHandler {
                pub_actor: state.pub_actor.clone(),
            }),
        )
        .add_method(
            "paramUpdate",
            Box::new(ParamUpdateHandler {
                param_actor: state.param_actor.clone(),
            }),
        )
        .add_method(
            "publisherUpdate",
            Box::new(PublisherUpdateHandler {
                sub_actor: state.sub_actor.clone(),
            }),
        )
        .add_method(
            "requestTopic",
            Box::new(RequestTopicHandler {
                pub_actor: state.pub_actor.clone(),
                advertised_host: state.advertised_host.clone(),
                tcpros_port: state.tcpros_address.port(),
            }),
        )
        .build()
}

/// Retrieve transport/topic statistics.
///
/// Per-connection byte counters are not tracked, so the stats arrays are
/// empty; the reply still follows the documented shape.
struct GetBusStatsHandler;

#[async_trait]
impl Handler for GetBusStatsHandler {
    async fn handle(&self, params: &[Value]) -> HandlerResult {
        let caller_id: String = get_params(params)?;

        trace!("getBusStats XML-RPC method called: [caller_id: {caller_id}]");

        let publish_stats: Vec<i32> = Vec::new();
        let subscribe_stats: Vec<i32> = Vec::new();
        let service_stats: Vec<i32> = Vec::new();

        HandlerResponse::new("bus stats", (publish_stats, subscribe_stats, service_stats))
    }
}

type BusInfoEntry = (i32, String, String, String, String, bool);

/// Retrieve transport/topic connection information.
struct GetBusInfoHandler {
    pub_actor: ActorRef<PublisherActorMsg>,
    sub_actor: ActorRef<SubscriberActorMsg>,
}

#[async_trait]
impl Handler for GetBusInfoHandler {
    async fn handle(&self, params: &[Value]) -> HandlerResult {
        let caller_id: String = get_params(params)?;

        trace!("getBusInfo XML-RPC method called: [caller_id: {caller_id}]");

        let mut entries: Vec<BusInfoEntry> = Vec::new();
        let mut connection_id = 0;

        let publications = call!(self.pub_actor, |reply| {
            PublisherActorMsg::GetPublications { reply }
        })
        .map_err(|e| server_error(format!("Failed to get publications: {e}")))?;

        for (topic_name, _) in publications {
            let subscribers = call!(self.pub_actor, |reply| {
                PublisherActorMsg::ConnectedSubscriberIds {
                    topic_name: topic_name.clone(),
                    reply,
                }
            })
            .map_err(|e| server_error(format!("Failed to get subscribers: {e}")))?;

            for subscriber in subscribers.unwrap_or_default() {
                entries.push((
                    connection_id,
                    subscriber,
                    "o".into(),
                    "TCPROS".into(),
                    topic_name.clone(),
                    true,
                ));
                connection_id += 1;
            }
        }

        let subscriptions = call!(self.sub_actor, |reply| {
            SubscriberActorMsg::GetSubscriptions { reply }
        })
        .map_err(|e| server_error(format!("Failed to get subscriptions: {e}")))?;

        for (topic_name, _) in subscriptions {
            let publishers = call!(self.sub_actor, |reply| {
                SubscriberActorMsg::ConnectedPublisherUris {
                    topic_name: topic_name.clone(),
                    reply,
                }
            })
            .map_err(|e| server_error(format!("Failed to get publishers: {e}")))?;

            for publisher in publishers.unwrap_or_default() {
                entries.push((
                    connection_id,
                    publisher,
                    "i".into(),
                    "TCPROS".into(),
                    topic_name.clone(),
                    true,
                ));
                connection_id += 1;
            }
        }

        HandlerResponse::new("bus info", entries)
    }
}

/// Get the master URI that the node is connected to.
struct GetMasterUriHandler {
    master_uri: Url,
}

#[async_trait]
impl Handler for GetMasterUriHandler {
    async fn handle(&self, params: &[Value]) -> HandlerResult {
        let caller_id: String = get_params(params)?;

        trace!("getMasterUri XML-RPC method called: [caller_id: {caller_id}]");
        HandlerResponse::new("Master URI", self.master_uri.to_string())
    }
}

/// Request the node to shut down.
struct ShutdownHandler {
    shutdown_mgr: ShutdownManager<Option<String>>,
}

type ShutdownParams = (String, String);

#[async_trait]
impl Handler for ShutdownHandler {
    async fn handle(&self, params: &[Value]) -> HandlerResult {
        let (caller_id, reason): ShutdownParams = get_params(params)?;

        trace!("shutdown XML-RPC method called: [caller_id: {caller_id}, reason: \"{reason}\"]");

        if self
            .shutdown_mgr
            .trigger_shutdown(Some(format!(
                "API request: [caller_id: {caller_id}, reason: \"{reason}\"]"
            )))
            .is_err()
        {
            warn!("XML-RPC shutdown requested, but node was already shutting down");
        }

        // Other ROS1 clients reply before the shutdown completes so the
        // remote side is not left hanging.
        HandlerResponse::new("Node shut down", 0)
    }
}

/// Get the PID of this node.
struct GetPidHandler;

#[async_trait]
impl Handler for GetPidHandler {
    async fn handle(&self, params: &[Value]) -> HandlerResult {
        let caller_id: String = get_params(params)?;

        trace!("getPid XML-RPC method called: [caller_id: {caller_id}]");
        HandlerResponse::new("PID", process::id() as i32)
    }
}

/// Retrieve a list of topics that this node subscribes to.
struct GetSubscriptionsHandler {
    sub_actor: ActorRef<SubscriberActorMsg>,
}

#[async_trait]
impl Handler for GetSubscriptionsHandler {
    async fn handle(&self, params: &[Value]) -> HandlerResult {
        let caller_id: String = get_params(params)?;

        trace!("getSubscriptions XML-RPC method called: [caller_id: {caller_id}]");

        let subscriptions = call!(self.sub_actor, |reply| {
            SubscriberActorMsg::GetSubscriptions { reply }
        })
        .map_err(|e| server_error(format!("Failed to get subscriptions: {e}")))?;

        HandlerResponse::new("List of subscriptions", subscriptions)
    }
}

/// Retrieve a list of topics that this node publishes.
struct GetPublicationsHandler {
    pub_actor: ActorRef<PublisherActorMsg>,
}

#[async_trait]
impl Handler for GetPublicationsHandler {
    async fn handle(&self, params: &[Value]) -> HandlerResult {
        let caller_id: String = get_params(params)?;

        trace!("getPublications XML-RPC method called: [caller_id: {caller_id}]");

        let publications = call!(self.pub_actor, |reply| {
            PublisherActorMsg::GetPublications { reply }
        })
        .map_err(|e| server_error(format!("Failed to get publications: {e}")))?;

        HandlerResponse::new("List of publications", publications)
    }
}

/// Callback from master with the updated value of a subscribed parameter.
struct ParamUpdateHandler {
    param_actor: ActorRef<ParameterActorMsg>,
}

type ParamUpdateParams = (String, String, Value);

#[async_trait]
impl Handler for ParamUpdateHandler {
    async fn handle(&self, params: &[Value]) -> HandlerResult {
        let (caller_id, param_name, new_value): ParamUpdateParams = get_params(params)?;

        trace!(
            "paramUpdate XML-RPC method called: [caller_id: {caller_id}, param_name: \"{param_name}\"]"
        );

        cast!(
            self.param_actor,
            ParameterActorMsg::UpdateCached {
                name: param_name,
                value: new_value,
            }
        )
        .map_err(|e| server_error(format!("Failed to update parameter: {e}")))?;

        HandlerResponse::new("Parameter updated", 0)
    }
}

/// Callback from master with the current publisher list for a topic.
struct PublisherUpdateHandler {
    sub_actor: ActorRef<SubscriberActorMsg>,
}

type PublisherUpdateParams = (String, String, Vec<String>);

#[async_trait]
impl Handler for PublisherUpdateHandler {
    async fn handle(&self, params: &[Value]) -> HandlerResult {
        let (caller_id, topic_name, publishers): PublisherUpdateParams = get_params(params)?;

        trace!(
            "publisherUpdate XML-RPC method called: [caller_id: {caller_id}, publishers: {publishers:?}]"
        );

        cast!(
            self.sub_actor,
            SubscriberActorMsg::UpdateConnectedPublishers {
                topic_name,
                publishers: BTreeSet::from_iter(publishers),
            }
        )
        .map_err(|e| server_error(format!("Failed to update connected publishers: {e}")))?;

        HandlerResponse::new("Publishers updated", 0)
    }
}

/// Channel negotiation: a subscriber asks where to stream a topic from.
struct RequestTopicHandler {
    pub_actor: ActorRef<PublisherActorMsg>,
    advertised_host: String,
    tcpros_port: u16,
}

type RequestTopicParams = (String, String, Vec<Vec<String>>);

#[async_trait]
impl Handler for RequestTopicHandler {
    async fn handle(&self, params: &[Value]) -> HandlerResult {
        let (caller_id, topic_name, protocols): RequestTopicParams = get_params(params)?;

        trace!(
            "requestTopic XML-RPC method called: [caller_id: {caller_id}, protocols: {protocols:?}]"
        );

        let tcpros_requested = protocols
            .iter()
            .any(|protocol| protocol.first().map(String::as_str) == Some("TCPROS"));

        if !tcpros_requested {
            return Err(server_error("No supported protocols requested"));
        }

        let publication = call!(self.pub_actor, |reply| {
            PublisherActorMsg::Lookup {
                topic_name: topic_name.clone(),
                reply,
            }
        })
        .map_err(|e| server_error(format!("Failed to look up publication: {e}")))?;

        match publication {
            Some(_) => {
                trace!(
                    "Topic \"{topic_name}\" ready at \"{}:{}\"",
                    self.advertised_host,
                    self.tcpros_port
                );

                HandlerResponse::new(
                    format!("ready on {}:{}", self.advertised_host, self.tcpros_port),
                    (
                        "TCPROS",
                        self.advertised_host.clone(),
                        self.tcpros_port as i32,
                    ),
                )
            }
            None => Err(invalid_request(format!(
                "Node is not currently publishing topic \"{topic_name}\""
            ))),
        }
    }
}
