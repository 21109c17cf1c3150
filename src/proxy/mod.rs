//! Filtering proxies placed between the sandbox and the network.
//!
//! The sandboxed process can only reach localhost proxy ports (or a Unix
//! socket bound into the jail); the proxies apply a shared domain
//! allow-list before dialing out.

pub mod filter;
pub mod http;
pub mod manager;
pub mod socks5;

pub use filter::DomainFilter;
pub use http::HttpProxy;
pub use manager::{Manager, ManagerConfig};
pub use socks5::Socks5Proxy;
