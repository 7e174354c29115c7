use std::{
    collections::{hash_map::Entry, HashMap},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
};

use ractor::{cast, Actor, ActorRef, RpcReplyPort};
use tokio::sync::mpsc;
use tracing::{instrument, trace, warn};

use crate::{
    msg::DynamicMessage,
    tcpros::service::{
        client::{ServiceCallError, ServiceClientLink},
        server::{ServiceCallback, ServiceServerLink, ServiceServerMsg},
        ServiceType,
    },
    xmlrpc::{ClientError, MasterClient},
};

#[derive(Debug, thiserror::Error)]
pub enum ServiceActorError {
    #[error("master client error: {0}")]
    Master(#[from] ClientError),
    #[error("service \"{0}\" is already advertised on this node")]
    AlreadyRegistered(String),
    #[error("service registry unavailable: {0}")]
    Registry(String),
}

pub type ServiceActorResult<T> = Result<T, ServiceActorError>;

pub enum ServiceActorMsg {
    Register {
        service_name: String,
        srv_type: ServiceType,
        caller_id: String,
        service_api: String,
        callback: ServiceCallback,
        reply: RpcReplyPort<ServiceActorResult<ServiceServer>>,
    },
    Unregister {
        service_name: String,
        reply: RpcReplyPort<ServiceActorResult<()>>,
    },
    Drop {
        service_name: String,
    },
    /// Look up the server worker for an inbound service-client connection.
    Lookup {
        service_name: String,
        reply: RpcReplyPort<Option<mpsc::Sender<ServiceServerMsg>>>,
    },
    GetServices {
        reply: RpcReplyPort<Vec<(String, String)>>,
    },
}

struct ServiceEntry {
    guard: Weak<ServiceGuard>,
    link: ServiceServerLink,
    srv_type: ServiceType,
    service_api: String,
}

pub struct ServiceActorState {
    master_client: MasterClient,
    services: HashMap<String, ServiceEntry>,
}

impl ServiceActorState {
    pub fn new(master_client: &MasterClient) -> Self {
        Self {
            master_client: master_client.clone(),
            services: HashMap::new(),
        }
    }
}

pub struct ServiceActor;

impl Actor for ServiceActor {
    type Msg = ServiceActorMsg;
    type State = ServiceActorState;
    type Arguments = ServiceActorState;

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
        for (service_name, entry) in std::mem::take(&mut state.services) {
            if let Err(e) = Self::cleanup_service(state, entry).await {
                warn!(
                    "Failed to clean up service: [service: \"{service_name}\", error: \"{e}\"]"
                );
            }
        }

        trace!("Service registry shutdown complete");
        Ok(())
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ractor::ActorProcessingErr> {
        match message {
            ServiceActorMsg::Register {
                service_name,
                srv_type,
                caller_id,
                service_api,
                callback,
                reply,
            } => {
                reply.send(
                    Self::register(
                        state,
                        myself,
                        service_name,
                        srv_type,
                        caller_id,
                        service_api,
                        callback,
                    )
                    .await,
                )?;
            }

            ServiceActorMsg::Unregister { service_name, reply } => {
                reply.send(Self::unregister(state, service_name).await)?;
            }

            ServiceActorMsg::Drop { service_name } => {
                if let Err(e) = Self::unregister(state, service_name).await {
                    warn!("Encountered an error while handling drop guard message: {e}");
                }
            }

            ServiceActorMsg::Lookup {
                service_name,
                reply,
            } => {
                let link = state
                    .services
                    .get(&service_name)
                    .map(|entry| entry.link.control());

                reply.send(link)?;
            }

            ServiceActorMsg::GetServices { reply } => {
                let services = state
                    .services
                    .iter()
                    .map(|(service_name, entry)| {
                        (service_name.clone(), entry.srv_type.name().to_string())
                    })
                    .collect();

                reply.send(services)?;
            }
        }

        Ok(())
    }
}

impl ServiceActor {
    async fn cleanup_service(
        state: &ServiceActorState,
        entry: ServiceEntry,
    ) -> ServiceActorResult<()> {
        if let Some(guard) = entry.guard.upgrade() {
            guard.disarm();
        }

        let service_name = entry.link.service_name().to_string();
        entry.link.shutdown().await;

        state
            .master_client
            .unregister_service(&service_name, &entry.service_api)
            .await?;

        Ok(())
    }

    #[instrument(skip_all, fields(service_name = service_name))]
    async fn register(
        state: &mut ServiceActorState,
        actor_ref: ActorRef<ServiceActorMsg>,
        service_name: String,
        srv_type: ServiceType,
        caller_id: String,
        service_api: String,
        callback: ServiceCallback,
    ) -> ServiceActorResult<ServiceServer> {
        trace!("Register called");

        if let Entry::Occupied(entry) = state.services.entry(service_name.clone()) {
            if entry.get().guard.upgrade().is_some() {
                return Err(ServiceActorError::AlreadyRegistered(service_name));
            }

            warn!("Stale service found in registry");

            let entry = entry.remove();
            if let Err(e) = Self::cleanup_service(state, entry).await {
                warn!("Failed to clean up stale service: {e}");
            }
        }

        let link = ServiceServerLink::new(&service_name, srv_type.clone(), &caller_id, callback);

        if let Err(e) = state
            .master_client
            .register_service(&service_name, &service_api)
            .await
        {
            link.shutdown().await;
            return Err(e.into());
        }

        let guard = Arc::new(ServiceGuard::new(&service_name, &actor_ref));

        state.services.insert(
            service_name.clone(),
            ServiceEntry {
                guard: Arc::downgrade(&guard),
                link,
                srv_type,
                service_api,
            },
        );

        Ok(ServiceServer {
            service_name,
            _guard: guard,
        })
    }

    #[instrument(skip(state))]
    async fn unregister(
        state: &mut ServiceActorState,
        service_name: String,
    ) -> ServiceActorResult<()> {
        trace!("Unregister called");

        if let Some(entry) = state.services.remove(&service_name) {
            Self::cleanup_service(state, entry).await?;
        }

        Ok(())
    }
}

/// Drop guard handle for one advertised service.
#[derive(Clone)]
pub struct ServiceServer {
    service_name: String,
    _guard: Arc<ServiceGuard>,
}

impl ServiceServer {
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub async fn shutdown(&self) -> Result<(), ServiceActorError> {
        self._guard.disarm();

        ractor::call!(&self._guard.actor_ref, |reply| {
            ServiceActorMsg::Unregister {
                service_name: self.service_name.clone(),
                reply,
            }
        })
        .map_err(|e| ServiceActorError::Registry(e.to_string()))?
    }
}

struct ServiceGuard {
    service_name: String,
    armed: AtomicBool,
    actor_ref: ActorRef<ServiceActorMsg>,
}

impl ServiceGuard {
    fn new(service_name: &str, actor_ref: &ActorRef<ServiceActorMsg>) -> Self {
        Self {
            service_name: service_name.to_string(),
            armed: AtomicBool::new(true),
            actor_ref: actor_ref.clone(),
        }
    }

    fn disarm(&self) {
        self.armed.store(false, Ordering::Release);
    }
}

impl Drop for ServiceGuard {
    fn drop(&mut self) {
        if self.armed.load(Ordering::Acquire) {
            if let Err(e) = cast!(
                &self.actor_ref,
                ServiceActorMsg::Drop {
                    service_name: self.service_name.clone(),
                }
            ) {
                warn!(
                    "Failed to trigger service cleanup: [service: \"{}\", error: \"{e}\"]",
                    self.service_name
                );
            }
        }
    }
}

/// Client handle for calling a remote service.
pub struct ServiceClient {
    link: ServiceClientLink,
}

impl ServiceClient {
    pub(crate) fn new(link: ServiceClientLink) -> Self {
        ServiceClient { link }
    }

    pub fn srv_type(&self) -> &ServiceType {
        self.link.srv_type()
    }

    pub async fn call(&self, request: DynamicMessage) -> Result<DynamicMessage, ServiceCallError> {
        self.link.call(request).await
    }
}
