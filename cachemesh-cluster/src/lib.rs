pub mod breaker;
pub mod coordinator;
pub mod membership;
pub mod protocol;
pub mod receiver;
pub mod sender;

pub use breaker::{BreakerConfig, BreakerState, CircuitBreaker};
pub use coordinator::{ClusterCoordinator, CoordinatorConfig};
pub use membership::{ClusterMembership, MembershipConfig, PeerSnapshot};
pub use protocol::ClusterMessage;
pub use receiver::{MessageReceiver, ReceiverConfig};
pub use sender::{MessageSender, SenderConfig};
