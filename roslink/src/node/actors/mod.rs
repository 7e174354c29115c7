pub mod parameter;
pub mod publisher;
pub mod service;
pub mod subscriber;
