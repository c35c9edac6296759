pub mod proxy;

pub use proxy::{NetworkFilter, ProxyServer};
