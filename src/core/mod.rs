//! Core types shared by every component: wire frames, identities, errors

pub mod error;
pub mod events;
pub mod frame;
pub mod participant;
pub mod session;
pub mod targets;
pub mod topic;

pub use error::{
    CacheError, ErrorKind, ErrorResponse, FrameError, RegistryError, SockError, SockResult,
    StoreError,
};
pub use events::{FrameBroker, FrameEnvelope, LocalBroker};
pub use frame::{FrameRef, SocketAction, SocketMessage};
pub use participant::{Participant, Participants};
pub use session::{HeaderSessionProvider, SessionIdentity, SessionProvider, Ticket};
pub use targets::{CONNECTION_ID_LEN, Targets};
pub use topic::{ExchangeClass, ExchangeTopic, SocketId};
