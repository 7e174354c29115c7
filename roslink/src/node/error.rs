use std::io;

use async_shutdown::{ShutdownAlreadyCompleted, ShutdownAlreadyStarted};
use ractor::{RactorErr, SpawnErr};

use crate::{
    codec::CodecError,
    dispatch::SubmitError,
    node::actors::{
        parameter::ParameterActorError, publisher::PublisherActorError,
        service::ServiceActorError, subscriber::SubscriberActorError,
    },
    tcpros::{publication::PublishError, service::client::ServiceCallError, HeaderMismatch},
    xmlrpc::ClientError,
};

#[derive(thiserror::Error, Debug)]
pub enum NodeError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("master API call failed: {0}")]
    Master(#[from] ClientError),
    #[error("master unreachable at \"{0}\"")]
    MasterUnreachable(String),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("incompatible headers: {0}")]
    Mismatch(#[from] HeaderMismatch),
    #[error("node is shutting down")]
    NotRunning,
    #[error(transparent)]
    Timeout(#[from] SubmitError),
    #[error(transparent)]
    Publish(#[from] PublishError),
    #[error(transparent)]
    ServiceCall(#[from] ServiceCallError),
    #[error("publisher registry error: {0}")]
    Publisher(#[from] PublisherActorError),
    #[error("subscriber registry error: {0}")]
    Subscriber(#[from] SubscriberActorError),
    #[error("service registry error: {0}")]
    Service(#[from] ServiceActorError),
    #[error("parameter error: {0}")]
    Parameter(#[from] ParameterActorError),
    #[error("Ractor error: {0}")]
    Ractor(String),
    #[error(transparent)]
    ActorSpawn(#[from] SpawnErr),
    #[error(transparent)]
    ShutdownAlreadyStarted(#[from] ShutdownAlreadyStarted<Option<String>>),
    #[error(transparent)]
    ShutdownAlreadyCompleted(#[from] ShutdownAlreadyCompleted<Option<String>>),
    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),
    #[error("invalid hostname: \"{0}\"")]
    InvalidHostname(String),
}

impl<T> From<RactorErr<T>> for NodeError {
    fn from(value: RactorErr<T>) -> Self {
        match value {
            RactorErr::Timeout => NodeError::Ractor("timeout".into()),
            RactorErr::Actor(e) => NodeError::Ractor(e.to_string()),
            RactorErr::Spawn(e) => NodeError::Ractor(e.to_string()),
            RactorErr::Messaging(e) => NodeError::Ractor(e.to_string()),
        }
    }
}
