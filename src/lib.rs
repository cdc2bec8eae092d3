pub mod config;
pub mod logging;
pub mod messages;
pub mod types;

pub mod acceptor_log;
pub mod lock;
pub mod membership;
pub mod work_queue;

pub mod client;
pub mod cluster;
pub mod communication;
pub mod node;
pub mod transport;
