//! MQTT 3.1.1 wire protocol: control packet codec and topic rules

pub mod packet;
pub mod topic;

pub use packet::{
    CodecError, ConnAck, Connect, ConnectReturnCode, LastWill, Packet, Publish, QoS, SubAck,
    Subscribe, SubscribeFilter, SubscribeReturnCode, Unsubscribe,
};
pub use topic::{matches, validate_topic_filter, validate_topic_name, TopicError};
