//! Session control for a hub-connected device.
//!
//! A [`DeviceSession`] turns message-listener registration into single-flight
//! enable/disable calls on the transport, restores delivery after a disconnect
//! under a retry policy, renews shared-access-signature credentials ahead of
//! expiry, and validates `set_options` and `upload_to_blob` before delegating.
pub mod activation;
mod actor;
pub mod config;
pub mod listeners;
pub mod renewal;
mod session;
pub mod supervisor;

pub use activation::{
    ActivationCall, ActivationState, FeatureActivationManager, Reactivation, SubscriberId,
};
pub use actor::SessionSnapshot;
pub use config::SessionConfig;
pub use listeners::{ListenerId, ListenerKind};
pub use renewal::RenewalScheduler;
pub use session::{DeviceSession, DeviceSessionBuilder};
pub use supervisor::{ReconnectSupervisor, RetryContext, SupervisorAction, SupervisorState};
