use dxr::{TryFromValue, TryToParams, TryToValue};
use tracing::debug;
use url::Url;

use crate::xmlrpc::protocol::{
    client::{Client, ClientError},
    RPC_FAILURE,
};

type SlaveResult<D> = Result<D, ClientError>;

/// Client implementation of the ROS1 Slave API.
///
/// Refer to <http://wiki.ros.org/ROS/Slave_API> for more information.
#[derive(Clone)]
pub struct SlaveClient {
    client: Client,
    caller_id: String,
}

impl SlaveClient {
    pub fn new(slave_url: &Url, caller_id: impl Into<String>) -> Self {
        SlaveClient {
            caller_id: caller_id.into(),
            client: Client::new(slave_url.clone()),
        }
    }

    async fn call<P: TryToParams, D: TryFromValue>(
        &self,
        method: &str,
        params: P,
    ) -> SlaveResult<D> {
        let params = params.try_to_params().map_err(ClientError::from)?;
        let result = self.client.call_raw(method, params).await?;

        Ok(D::try_from_value(&result)?)
    }

    /// Get the URI of the master this node is connected to.
    pub async fn get_master_uri(&self) -> SlaveResult<String> {
        self.call("getMasterUri", self.caller_id.as_str()).await
    }

    /// Signal a node to shut down.
    pub async fn shutdown(&self, reason: &str) -> SlaveResult<()> {
        // The resulting i32 is intentionally ignored per the API docs.
        self.call::<_, i32>("shutdown", (&self.caller_id, reason))
            .await?;

        Ok(())
    }

    /// Get the PID of a node.
    pub async fn get_pid(&self) -> SlaveResult<i32> {
        self.call("getPid", self.caller_id.as_str()).await
    }

    /// Get a list of topics that this node subscribes to.
    pub async fn get_subscriptions(&self) -> SlaveResult<Vec<(String, String)>> {
        self.call("getSubscriptions", self.caller_id.as_str()).await
    }

    /// Get a list of topics that this node publishes.
    pub async fn get_publications(&self) -> SlaveResult<Vec<(String, String)>> {
        self.call("getPublications", self.caller_id.as_str()).await
    }

    /// Inform a node that the value of a subscribed parameter has changed.
    pub async fn param_update<P>(&self, param_name: &str, value: P) -> SlaveResult<()>
    where
        P: TryToValue,
    {
        // The resulting i32 is intentionally ignored per the API docs.
        self.call::<_, i32>("paramUpdate", (&self.caller_id, param_name, value))
            .await?;

        Ok(())
    }

    /// Inform a node that the publisher list for a topic has changed.
    pub async fn publisher_update(
        &self,
        topic_name: &str,
        publishers: Vec<String>,
    ) -> SlaveResult<()> {
        let _ignore: i32 = self
            .call("publisherUpdate", (&self.caller_id, topic_name, publishers))
            .await?;

        Ok(())
    }

    /// Ask a publisher to allocate a channel for the given topic.
    ///
    /// The subscriber offers its supported protocols; the publisher answers
    /// with the selected protocol plus its connection parameters. Returns
    /// `None` when the publisher supports none of the offered protocols
    /// (reported as a failure status by both rospy and roscpp).
    pub async fn request_topic<T>(
        &self,
        topic_name: &str,
        protocols: Vec<Vec<String>>,
    ) -> SlaveResult<Option<T>>
    where
        T: TryFromValue,
    {
        let result: SlaveResult<T> = self
            .call("requestTopic", (&self.caller_id, topic_name, protocols))
            .await;

        match result {
            Ok(protocol_info) => Ok(Some(protocol_info)),
            Err(ClientError::Remote {
                code: RPC_FAILURE,
                message,
            }) => {
                debug!("requestTopic refused: {message}");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}
