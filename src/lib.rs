pub mod api;
pub mod broker;
pub mod bus;
pub mod collab;
pub mod config;
pub mod error;
pub mod gateway;
pub mod node;
pub mod protocol;
pub mod registry;
pub mod shutdown;
pub mod supervisor;
