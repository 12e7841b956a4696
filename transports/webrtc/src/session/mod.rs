//! Session management
//!
//! One [`SessionManager`] drives a sending or receiving session against the
//! relay and reports progress through [`SessionEvent`]s.

pub mod events;
pub mod manager;
pub mod registry;
pub mod state;

pub use events::{EventBus, SessionEvent, SessionObserver, SubscriptionId};
pub use manager::{SessionManager, SessionManagerBuilder, ICE_FAILED_MESSAGE};
pub use registry::StreamRegistry;
pub use state::{ConnectionState, Role};
