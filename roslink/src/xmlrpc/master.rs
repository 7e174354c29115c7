use std::{
    collections::{HashMap, HashSet},
    time::Duration,
};

use dxr::{TryFromValue, TryToParams, TryToValue, Value};
use tracing::debug;
use url::Url;

use crate::xmlrpc::protocol::{
    client::{Client, ClientError},
    RPC_ERROR,
};

type RawSystemState = [Vec<(String, Vec<String>)>; 3];
type StateEntry = HashMap<String, HashSet<String>>;

/// Timeout for the master reachability probe.
const PING_TIMEOUT: Duration = Duration::from_secs(1);

/// A more user-friendly representation of the ROS master's state.
#[derive(Debug)]
pub struct SystemState {
    publishers: StateEntry,
    subscribers: StateEntry,
    service_providers: StateEntry,
}

impl SystemState {
    fn node_provides_resource(state: &StateEntry, node_name: &str, resource: &str) -> bool {
        state
            .get(resource)
            .is_some_and(|entry| entry.contains(node_name))
    }

    /// Check if a node is publishing to a specific topic.
    pub fn is_publishing(&self, node_name: &str, topic_name: &str) -> bool {
        Self::node_provides_resource(&self.publishers, node_name, topic_name)
    }

    /// Check if a node is subscribed to a specific topic.
    pub fn is_subscribed(&self, node_name: &str, topic_name: &str) -> bool {
        Self::node_provides_resource(&self.subscribers, node_name, topic_name)
    }

    /// Check if a node is providing a specific service.
    pub fn is_providing_service(&self, node_name: &str, service_name: &str) -> bool {
        Self::node_provides_resource(&self.service_providers, node_name, service_name)
    }
}

impl TryFromValue for SystemState {
    fn try_from_value(value: &Value) -> Result<Self, dxr::DxrError> {
        let raw_state = RawSystemState::try_from_value(value)?;

        let [publishers, subscribers, service_providers] = raw_state.map(|state| {
            state
                .into_iter()
                .map(|(key, values)| (key, values.into_iter().collect()))
                .collect()
        });

        Ok(SystemState {
            publishers,
            subscribers,
            service_providers,
        })
    }
}

type MasterResult<D> = Result<D, ClientError>;

/// Client implementation of the ROS1 Master API.
///
/// Refer to <http://wiki.ros.org/ROS/Master_API> &
/// <http://wiki.ros.org/ROS/Parameter%20Server%20API> for more information.
#[derive(Clone)]
pub struct MasterClient {
    client: Client,
    caller_id: String,
    caller_api: String,
}

impl MasterClient {
    pub fn new(
        master_url: &Url,
        caller_id: impl Into<String>,
        caller_api: impl Into<String>,
    ) -> Self {
        MasterClient {
            caller_id: caller_id.into(),
            caller_api: caller_api.into(),
            client: Client::new(master_url.clone()),
        }
    }

    async fn call<P: TryToParams, D: TryFromValue>(
        &self,
        method: &str,
        params: P,
    ) -> MasterResult<D> {
        let params = params.try_to_params().map_err(ClientError::from)?;
        let result = self.client.call_raw(method, params).await?;

        Ok(D::try_from_value(&result)?)
    }

    /// Probe master reachability with a short deadline.
    pub async fn ping(&self) -> bool {
        let params = match self.caller_id.as_str().try_to_params() {
            Ok(params) => params,
            Err(_) => return false,
        };

        match self
            .client
            .call_with_timeout("getUri", params, PING_TIMEOUT)
            .await
        {
            Ok(_) => true,
            Err(e) => {
                debug!("Master ping failed: {e}");
                false
            }
        }
    }

    /// Register the caller as a provider of the specified service.
    pub async fn register_service(
        &self,
        service_name: &str,
        service_api: &str,
    ) -> MasterResult<()> {
        // The resulting i32 is intentionally ignored per the API docs.
        self.call::<_, i32>(
            "registerService",
            (&self.caller_id, service_name, service_api, &self.caller_api),
        )
        .await?;

        Ok(())
    }

    /// Unregister the caller as a provider of the specified service.
    pub async fn unregister_service(
        &self,
        service_name: &str,
        service_api: &str,
    ) -> MasterResult<i32> {
        self.call(
            "unregisterService",
            (&self.caller_id, service_name, service_api),
        )
        .await
    }

    /// Subscribe the caller to the specified topic.
    ///
    /// Returns the XML-RPC URIs of every node currently publishing it;
    /// later changes arrive through the slave API's `publisherUpdate`.
    pub async fn register_subscriber(
        &self,
        topic_name: &str,
        topic_type: &str,
    ) -> MasterResult<Vec<String>> {
        self.call(
            "registerSubscriber",
            (&self.caller_id, topic_name, topic_type, &self.caller_api),
        )
        .await
    }

    /// Unregister the caller as a subscriber of the topic.
    pub async fn unregister_subscriber(&self, topic_name: &str) -> MasterResult<i32> {
        self.call(
            "unregisterSubscriber",
            (&self.caller_id, topic_name, &self.caller_api),
        )
        .await
    }

    /// Register the caller as a publisher of the topic.
    ///
    /// Returns the XML-RPC URIs of every current subscriber.
    pub async fn register_publisher(
        &self,
        topic_name: &str,
        topic_type: &str,
    ) -> MasterResult<Vec<String>> {
        self.call(
            "registerPublisher",
            (&self.caller_id, topic_name, topic_type, &self.caller_api),
        )
        .await
    }

    /// Unregister the caller as a publisher of the topic.
    pub async fn unregister_publisher(&self, topic_name: &str) -> MasterResult<i32> {
        self.call(
            "unregisterPublisher",
            (&self.caller_id, topic_name, &self.caller_api),
        )
        .await
    }

    /// Get the XML-RPC URI of the node with the associated name.
    pub async fn lookup_node(&self, node_name: &str) -> MasterResult<String> {
        self.call("lookupNode", (&self.caller_id, node_name)).await
    }

    /// Get the list of topics that currently have publishers, keyed to
    /// their types.
    pub async fn get_published_topics(
        &self,
        subgraph: Option<&str>,
    ) -> MasterResult<HashMap<String, String>> {
        let raw_result: Vec<(String, String)> = self
            .call(
                "getPublishedTopics",
                (&self.caller_id, subgraph.unwrap_or_default()),
            )
            .await?;

        Ok(raw_result.into_iter().collect())
    }

    /// Retrieve all known topic names keyed to their types.
    pub async fn get_topic_types(&self) -> MasterResult<HashMap<String, String>> {
        let raw_result: Vec<(String, String)> =
            self.call("getTopicTypes", self.caller_id.as_str()).await?;

        Ok(raw_result.into_iter().collect())
    }

    /// Retrieve system state (publishers, subscribers, and services).
    pub async fn get_system_state(&self) -> MasterResult<SystemState> {
        self.call("getSystemState", self.caller_id.as_str()).await
    }

    /// Get the URI of the master.
    pub async fn get_uri(&self) -> MasterResult<String> {
        self.call("getUri", self.caller_id.as_str()).await
    }

    /// Look up the provider of a particular service.
    pub async fn lookup_service(&self, service_name: &str) -> MasterResult<String> {
        self.call("lookupService", (&self.caller_id, service_name))
            .await
    }

    /// Retrieve a parameter value from the server.
    pub async fn get_param<P>(&self, param_name: &str) -> MasterResult<Option<P>>
    where
        P: TryFromValue,
    {
        Ok(self
            .get_param_any(param_name)
            .await?
            .map(|param| P::try_from_value(&param))
            .transpose()?)
    }

    /// Retrieve a parameter value from the server as a raw XML-RPC value.
    pub async fn get_param_any(&self, param_name: &str) -> MasterResult<Option<Value>> {
        match self.call("getParam", (&self.caller_id, param_name)).await {
            Ok(value) => Ok(Some(value)),
            // rosmaster answers with a caller error when the key is unset.
            Err(ClientError::Remote {
                code: RPC_ERROR, ..
            }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Set a parameter.
    ///
    /// NOTE: a dictionary value is treated as a parameter tree rooted at the
    /// key, replacing everything below it.
    pub async fn set_param<V>(&self, param_name: &str, value: V) -> MasterResult<i32>
    where
        V: TryToValue,
    {
        let value = value.try_to_value().map_err(ClientError::from)?;
        self.set_param_any(param_name, &value).await
    }

    /// Set a parameter from a raw XML-RPC value.
    pub async fn set_param_any(&self, param_name: &str, value: &Value) -> MasterResult<i32> {
        self.call("setParam", (&self.caller_id, param_name, value))
            .await
    }

    /// Delete a parameter.
    pub async fn delete_param(&self, param_name: &str) -> MasterResult<i32> {
        self.call("deleteParam", (&self.caller_id, param_name))
            .await
    }

    /// Search for a parameter key, walking up through parent namespaces.
    pub async fn search_param(&self, param_name: &str) -> MasterResult<Option<String>> {
        match self
            .call("searchParam", (&self.caller_id, param_name))
            .await
        {
            Ok(key) => Ok(Some(key)),
            Err(ClientError::Remote {
                code: RPC_ERROR, ..
            }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Subscribe to updates for a parameter, returning its current value.
    pub async fn subscribe_param_any(&self, param_name: &str) -> MasterResult<Value> {
        self.call(
            "subscribeParam",
            (&self.caller_id, &self.caller_api, param_name),
        )
        .await
    }

    /// Unsubscribe from updates for a particular parameter.
    pub async fn unsubscribe_param(&self, param_name: &str) -> MasterResult<i32> {
        self.call(
            "unsubscribeParam",
            (&self.caller_id, &self.caller_api, param_name),
        )
        .await
    }

    /// Check if a parameter is stored on the server.
    pub async fn has_param(&self, param_name: &str) -> MasterResult<bool> {
        self.call("hasParam", (&self.caller_id, param_name)).await
    }

    /// Get a list of all parameter names stored on the server.
    pub async fn get_param_names(&self) -> MasterResult<Vec<String>> {
        self.call("getParamNames", self.caller_id.as_str()).await
    }
}
