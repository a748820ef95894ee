//! rtunnel shared library
//!
//! Wire protocol, error taxonomy, content codecs and TLS trust policy used by
//! both the relay and the client.

pub mod encoding;
pub mod error;
pub mod protocol;
pub mod trust;

pub use error::{Error, Result};
pub use protocol::{Command, CommandKind, HttpRequestData, HttpResponseData, TunnelInfo};
