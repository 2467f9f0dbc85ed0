//! V2-to-V1 translating proxy: the per-connection translator state machine
//! and the proxy shell that accepts downstream V2 connections and opens a
//! matching upstream V1 connection for each.

pub mod proxy;
pub mod translator;

pub use proxy::{Proxy, ProxyConfig, UpstreamAcceptor};
pub use translator::{State, Translator};
