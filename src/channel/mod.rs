//! Channel layer: one shared connection multiplexed into named channels.

mod policy;
mod registry;
mod session;

pub use policy::ReconnectPolicy;
pub use registry::TransportRegistry;
pub use session::{Channel, ChannelMessage, ChannelStatus, Handler, HandlerId};
