mod master;
mod slave;

pub mod protocol;

pub use {
    master::{MasterClient, SystemState},
    protocol::client::ClientError,
    slave::SlaveClient,
};
