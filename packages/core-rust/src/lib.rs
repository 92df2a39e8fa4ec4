//! `microbus` core — subject grammar, `$SRV` protocol payloads, and the transport contract.

pub mod message;
pub mod protocol;
pub mod record;
pub mod subject;
pub mod traits;

pub use message::{Headers, Message, ERROR_CODE_HEADER, ERROR_HEADER};
pub use protocol::{
    ClientInfo, ConnectionInfo, DisconnectAdvisory, EndpointInfo, EndpointStats,
    ErrorDescriptor, InfoResponse, PingResponse, ServiceIdentity, StatsResponse,
};
pub use record::{now_millis, ServiceRecord};
pub use subject::{
    default_method_name, derive_endpoint, BalancingMode, DiscoveryVerb, Endpoint,
    REGISTRATION_SUBJECT,
};
pub use traits::{Subscription, SubscriptionId, Transport, TransportError};
