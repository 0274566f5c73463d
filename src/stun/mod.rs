//! STUN wire codec and client-side transaction machinery.

pub mod attribute;
pub mod channel_data;
pub mod manager;
pub mod message;
pub mod pacer;
pub mod request;

pub use attribute::{StunAttribute, StunAttributeType};
pub use channel_data::ChannelData;
pub use manager::{InboundRequest, ServerRegistration, StunManager};
pub use message::{
    looks_like_stun, IntegrityKey, KeyLookup, NoKeys, StunClass, StunMessage, StunType,
    TransactionId, SOFTWARE,
};
pub use pacer::BindingPacer;
pub use request::{StunRequest, StunResponse};
