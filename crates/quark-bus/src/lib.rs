pub mod broker;
pub mod bus;
pub mod error;
pub mod memory;
pub mod publishers;
pub mod subscription;

pub use broker::{Broker, ConsumerConfig, ConsumerInfo, DeliverPolicy, Message, StreamConfig, StreamInfo};
pub use bus::{BusConfig, ConnectionInfo, EventBus, HistoryQuery};
pub use error::{BusError, BusResult};
pub use memory::MemoryBroker;
pub use publishers::{HealthChange, kinds};
pub use subscription::{EventHandler, HandlerError, SubscribeOptions, Subscription, SubscriptionSnapshot};
