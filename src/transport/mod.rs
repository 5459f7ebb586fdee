//! Concrete transport pieces: origin connections and TLS material.

pub mod client;
pub mod tls;

pub use client::OriginConnector;
pub use tls::{origin_client_config, TlsIdentity};

pub(crate) use client::connect_tcp;
