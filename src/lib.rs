//! A local forward proxy that relays HTTP traffic, tunnels CONNECT requests
//! and records every exchange as a [`ProxyEvent`] for later inspection.
//!
//! ```no_run
//! # async fn demo() -> capture_proxy::Result<()> {
//! use capture_proxy::{ProxyConfig, ProxyServer};
//!
//! let server = ProxyServer::new(ProxyConfig::default())?;
//! let context = server.start().await?;
//!
//! let client = reqwest::Client::builder()
//!     .proxy(context.reqwest_proxy()?)
//!     .build()
//!     .map_err(|e| capture_proxy::ProxyError::Io(std::io::Error::other(e)))?;
//! # let _ = client;
//!
//! println!("{}", context.events_captured()?.summary());
//! server.stop().await?;
//! # Ok(())
//! # }
//! ```

pub mod capture;
pub mod config;
pub mod error;
pub mod proxy;
pub mod server;
pub mod transport;

pub use capture::{CapturedRequest, CapturedResponse, EventsCaptured, HeaderSet, ProxyEvent};
pub use config::{CollectorConfig, ProxyConfig};
pub use error::{ProxyError, Result, StateError};
pub use proxy::MARKER_HEADER;
pub use server::{ambient, ProxyAddress, ProxyContext, ProxyServer, RuntimeInfo};
