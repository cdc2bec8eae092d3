//! Ways of getting a request from one node to another.
//!
//! [`local::LocalTransport`] routes requests between nodes of the same process
//! and can simulate failures; [`http`] serves and calls nodes over
//! `GET /api/<method>?key=value` requests with JSON replies.

pub mod http;
pub mod local;

pub use http::HttpTransport;
pub use local::LocalTransport;
