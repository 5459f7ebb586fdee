//! Captured exchange model and the capture log.
//!
//! Every exchange relayed by the proxy ends up as one [`ProxyEvent`] in the
//! [`EventStore`]. Bodies are only recorded through a [`ContentTap`] when the
//! collector policy asks for them.

pub mod event;
pub mod headers;
pub mod store;
pub mod tap;

pub use event::{CapturedRequest, CapturedResponse, ProxyEvent};
pub use headers::{HeaderEntry, HeaderSet};
pub use store::{EventStore, EventsCaptured};
pub use tap::{ContentTap, TapBody};
