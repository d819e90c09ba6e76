mod bridge;
mod channel;
mod constants;
mod endpoint;
mod error;
mod locator;
mod message;
mod prelude;
pub mod retry;
mod server;
mod socket;
mod time_util;
mod trace;

#[cfg(test)]
mod integration_tests;

pub use bridge::Bridge;
pub use channel::DirectionalChannel;
pub use endpoint::Endpoint;
pub use error::{BridgeError, ChannelError, ConnectError, LocatorError};
pub use locator::TargetLocator;
pub use message::{CONSOLE_API_METHOD, CONTEXT_DESTROYED_METHOD, SESSION_START_METHOD};
pub use prelude::PreludeRecorder;
pub use server::{BridgeServer, BridgeServerBuilder, BridgeServerBuilderError};
