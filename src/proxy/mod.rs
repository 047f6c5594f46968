//! The data-plane proxy: engine, target selection, transports, and the
//! supporting caches.

pub mod balancer;
pub mod breaker;
pub mod discovery;
pub mod engine;
pub mod loopback;
pub mod transport;
pub mod websocket;

pub use engine::{ProxyBody, ProxyRequest, ProxyResponse, RetainHost, ReverseProxy};
