use std::{
    collections::{hash_map::Entry, HashMap, HashSet},
    sync::LazyLock,
};

use dxr::{TryToValue, Value};
use ractor::{Actor, ActorRef, RpcReplyPort};
use tracing::{instrument, trace, warn};

use crate::xmlrpc::{ClientError, MasterClient};

// What the master sends to updateParam when a subscribed key is deleted.
static EMPTY_STRUCT: LazyLock<Value> = LazyLock::new(|| {
    HashMap::<String, String>::new()
        .try_to_value()
        .expect("try_to_value is infallible for HashMap<String,String>")
});

#[derive(Debug, thiserror::Error)]
pub enum ParameterActorError {
    #[error("master client error: {0}")]
    Master(#[from] ClientError),
}

pub type ParameterActorResult<T> = Result<T, ParameterActorError>;

pub enum ParameterActorMsg {
    Get {
        name: String,
        reply: RpcReplyPort<ParameterActorResult<Option<Value>>>,
    },
    /// Like `Get`, but subscribes to future updates and serves repeats from
    /// the local cache.
    GetCached {
        name: String,
        reply: RpcReplyPort<ParameterActorResult<Option<Value>>>,
    },
    Set {
        name: String,
        value: Value,
        reply: RpcReplyPort<ParameterActorResult<()>>,
    },
    Delete {
        name: String,
        reply: RpcReplyPort<ParameterActorResult<()>>,
    },
    Search {
        name: String,
        reply: RpcReplyPort<ParameterActorResult<Option<String>>>,
    },
    Exists {
        name: String,
        reply: RpcReplyPort<ParameterActorResult<bool>>,
    },
    GetNames {
        reply: RpcReplyPort<ParameterActorResult<Vec<String>>>,
    },
    Unsubscribe {
        name: String,
        reply: RpcReplyPort<ParameterActorResult<()>>,
    },
    /// Routed over from the slave API's `paramUpdate`.
    UpdateCached {
        name: String,
        value: Value,
    },
}

pub struct ParameterActorState {
    master_client: MasterClient,
    param_cache: HashMap<String, Value>,
    subscribed_params: HashSet<String>,
}

impl ParameterActorState {
    pub fn new(master_client: &MasterClient) -> Self {
        Self {
            master_client: master_client.clone(),
            param_cache: HashMap::new(),
            subscribed_params: HashSet::new(),
        }
    }
}

pub struct ParameterActor;

impl Actor for ParameterActor {
    type Msg = ParameterActorMsg;
    type State = ParameterActorState;
    type Arguments = ParameterActorState;

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
        for param_name in std::mem::take(&mut state.subscribed_params) {
            trace!("Unsubscribing from updates for param \"{param_name}\"");

            if let Err(e) = state.master_client.unsubscribe_param(&param_name).await {
                warn!("Failed to unsubscribe from parameter updates: {e}");
            }
        }

        trace!("Parameter actor shutdown complete");
        Ok(())
    }

    async fn handle(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ractor::ActorProcessingErr> {
        match message {
            ParameterActorMsg::Get { name, reply } => {
                reply.send(Self::get(state, name).await)?;
            }
            ParameterActorMsg::GetCached { name, reply } => {
                reply.send(Self::get_cached(state, name).await)?;
            }
            ParameterActorMsg::Set { name, value, reply } => {
                reply.send(Self::set(state, name, value).await)?;
            }
            ParameterActorMsg::Delete { name, reply } => {
                reply.send(Self::delete(state, name).await)?;
            }
            ParameterActorMsg::Search { name, reply } => {
                reply.send(Self::search(state, name).await)?;
            }
            ParameterActorMsg::Exists { name, reply } => {
                reply.send(Self::exists(state, name).await)?;
            }
            ParameterActorMsg::GetNames { reply } => {
                reply.send(Self::get_names(state).await)?;
            }
            ParameterActorMsg::Unsubscribe { name, reply } => {
                reply.send(Self::unsubscribe(state, name).await)?;
            }
            ParameterActorMsg::UpdateCached { name, value } => {
                if let Err(e) = Self::update_cached(state, name, value).await {
                    warn!("Failed to update cached parameter: {e}");
                }
            }
        }

        Ok(())
    }
}

impl ParameterActor {
    #[instrument(skip(state))]
    async fn get(
        state: &mut ParameterActorState,
        param_name: String,
    ) -> ParameterActorResult<Option<Value>> {
        trace!("Get called");

        Ok(state.master_client.get_param_any(&param_name).await?)
    }

    #[instrument(skip(state))]
    async fn get_cached(
        state: &mut ParameterActorState,
        param_name: String,
    ) -> ParameterActorResult<Option<Value>> {
        trace!("GetCached called");

        if !state.subscribed_params.contains(&param_name) {
            trace!("Subscribing to parameter updates");

            // subscribeParam returns an empty map for unset keys, which is
            // indistinguishable from a real empty-map value, so the result
            // is ignored in favor of a getParam.
            state.master_client.subscribe_param_any(&param_name).await?;
            state.subscribed_params.insert(param_name.clone());
        }

        match state.param_cache.entry(param_name.clone()) {
            Entry::Occupied(entry) => {
                trace!("Parameter present in cache");
                Ok(Some(entry.get().clone()))
            }
            Entry::Vacant(entry) => {
                trace!("Parameter not present in cache");

                let param = state.master_client.get_param_any(&param_name).await?;

                if let Some(value) = &param {
                    entry.insert(value.clone());
                }

                Ok(param)
            }
        }
    }

    #[instrument(skip(state, value))]
    async fn set(
        state: &mut ParameterActorState,
        param_name: String,
        value: Value,
    ) -> ParameterActorResult<()> {
        trace!("Set called");

        state
            .master_client
            .set_param_any(&param_name, &value)
            .await?;

        // The cache tracks only keys this node subscribed to.
        if state.subscribed_params.contains(&param_name) {
            state.param_cache.insert(param_name, value);
        }

        Ok(())
    }

    #[instrument(skip(state))]
    async fn delete(
        state: &mut ParameterActorState,
        param_name: String,
    ) -> ParameterActorResult<()> {
        trace!("Delete called");

        state.master_client.delete_param(&param_name).await?;

        if state.subscribed_params.remove(&param_name) {
            trace!("Unsubscribing from parameter updates");
            state.master_client.unsubscribe_param(&param_name).await?;
        }

        state.param_cache.remove(&param_name);

        Ok(())
    }

    #[instrument(skip(state))]
    async fn search(
        state: &mut ParameterActorState,
        param_name: String,
    ) -> ParameterActorResult<Option<String>> {
        trace!("Search called");

        Ok(state.master_client.search_param(&param_name).await?)
    }

    #[instrument(skip(state))]
    async fn exists(
        state: &mut ParameterActorState,
        param_name: String,
    ) -> ParameterActorResult<bool> {
        trace!("Exists called");

        Ok(state.master_client.has_param(&param_name).await?)
    }

    #[instrument(skip(state))]
    async fn get_names(state: &mut ParameterActorState) -> ParameterActorResult<Vec<String>> {
        trace!("GetNames called");

        Ok(state.master_client.get_param_names().await?)
    }

    #[instrument(skip(state))]
    async fn unsubscribe(
        state: &mut ParameterActorState,
        param_name: String,
    ) -> ParameterActorResult<()> {
        trace!("Unsubscribe called");

        if state.subscribed_params.remove(&param_name) {
            state.master_client.unsubscribe_param(&param_name).await?;
        }

        state.param_cache.remove(&param_name);

        Ok(())
    }

    #[instrument(skip(state, value))]
    async fn update_cached(
        state: &mut ParameterActorState,
        param_name: String,
        value: Value,
    ) -> ParameterActorResult<()> {
        trace!("UpdateCached called");

        if !state.subscribed_params.contains(&param_name) {
            warn!("Node not currently subscribed to updates for this parameter");
            return Ok(());
        }

        // A deletion arrives as an empty dictionary; confirm with the
        // master before invalidating, since an empty map is also a value.
        if value != *EMPTY_STRUCT || state.master_client.has_param(&param_name).await? {
            trace!("Updating parameter cache");
            state.param_cache.insert(param_name, value);
        } else {
            trace!("Param was deleted, removing from cache");
            state.param_cache.remove(&param_name);
        }

        Ok(())
    }
}
