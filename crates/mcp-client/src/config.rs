//! Server configuration types — re-exported from `conduit-domain`.
//!
//! The canonical definitions live in `conduit_domain::config` so that a
//! host's config deserializer can include them without depending on the
//! full client crate.

pub use conduit_domain::config::{dedupe_servers, McpServerConfig, McpTransportKind};
