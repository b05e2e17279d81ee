mod errors;
pub use errors::{BrokerError, Result};

mod channel;
pub use channel::{
    Broker, BrokerConfig, BrokerKind, Channel, Consumer, DeliveryStream, ExchangeKind, QueueOptions,
};

pub mod routing;

mod memory_broker;
pub use memory_broker::{MemoryBroker, MemoryChannel};

mod amqp_broker;
pub use amqp_broker::{AmqpBroker, AmqpChannel};
