mod config;
mod dispatch;
mod engine;
mod identity;
mod locator_update;
mod node;
mod packet;
mod sink;
mod table;
mod transport;

pub use config::{Config, ConfigError};
pub use dispatch::{Delivered, SHUTDOWN_ENV};
pub use engine::{ReplyPolicy, RoutingMode};
pub use identity::{Address, Identifier, InvalidLocatorError, Locator};
pub use locator_update::UnsolicitedUpdatePolicy;
pub use node::Node;
pub use packet::{Packet, PacketBody, PacketError};
pub use sink::{MockDataGenerator, SensorReading};
pub use transport::{Outbound, RawDatagram};
