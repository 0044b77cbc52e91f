//! Single-flight control of cloud-to-device delivery.
//!
//! Subscribers come and go; the transport only hears about it when the set
//! flips between empty and non-empty. At most one enable/disable call is in
//! flight at a time. Changes that arrive meanwhile are reconciled once that
//! call completes, so overlapping transitions collapse into the minimal calls.

use std::collections::HashSet;

use hdc_core::TransportError;
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(Uuid);

impl SubscriberId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriberId {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationState {
    Inactive,
    Activating,
    Active,
    Deactivating,
    /// Last activation failed, or delivery was lost on disconnect.
    Failed,
}

/// Transport call the owner of the manager must issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationCall {
    Enable,
    Disable,
}

impl ActivationCall {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivationCall::Enable => "enable",
            ActivationCall::Disable => "disable",
        }
    }
}

/// Answer to a recovery request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reactivation {
    /// A new enable call must be issued.
    Started,
    /// An enable call is already in flight; its outcome answers the request.
    Joined,
    /// A disable call is in flight; the follow-up enable answers the request.
    Deferred,
    AlreadyActive,
    /// Nobody subscribes any more.
    NotWanted,
}

#[derive(Debug)]
pub struct EnableOutcome {
    pub result: Result<(), TransportError>,
    /// The call was issued on behalf of subscribers (errors go to the error channel).
    pub for_subscribers: bool,
    /// The call answers a recovery attempt.
    pub for_recovery: bool,
    pub next: Option<ActivationCall>,
}

#[derive(Debug)]
pub struct DisableOutcome {
    pub result: Result<(), TransportError>,
    pub next: Option<ActivationCall>,
}

#[derive(Debug, Default)]
struct InFlight {
    for_subscribers: bool,
    for_recovery: bool,
}

#[derive(Debug)]
pub struct FeatureActivationManager {
    subscribers: HashSet<SubscriberId>,
    state: ActivationState,
    in_flight: InFlight,
    recovery_after_disable: bool,
}

impl Default for FeatureActivationManager {
    fn default() -> Self {
        Self::new()
    }
}

impl FeatureActivationManager {
    pub fn new() -> Self {
        Self {
            subscribers: HashSet::new(),
            state: ActivationState::Inactive,
            in_flight: InFlight::default(),
            recovery_after_disable: false,
        }
    }

    pub fn state(&self) -> ActivationState {
        self.state
    }

    pub fn is_wanted(&self) -> bool {
        !self.subscribers.is_empty()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    fn in_flight(&self) -> bool {
        matches!(
            self.state,
            ActivationState::Activating | ActivationState::Deactivating
        )
    }

    pub fn subscribe(&mut self, id: SubscriberId) -> Option<ActivationCall> {
        let was_empty = self.subscribers.is_empty();
        if !self.subscribers.insert(id) || !was_empty {
            return None;
        }
        self.reconcile()
    }

    pub fn unsubscribe(&mut self, id: SubscriberId) -> Option<ActivationCall> {
        if !self.subscribers.remove(&id) || !self.subscribers.is_empty() {
            return None;
        }
        self.reconcile()
    }

    fn reconcile(&mut self) -> Option<ActivationCall> {
        if self.in_flight() {
            debug!(state = ?self.state, "call in flight, deferring reconcile");
            return None;
        }
        match (self.state, self.is_wanted()) {
            (ActivationState::Inactive | ActivationState::Failed, true) => {
                self.state = ActivationState::Activating;
                self.in_flight = InFlight {
                    for_subscribers: true,
                    for_recovery: false,
                };
                Some(ActivationCall::Enable)
            }
            // Lost or failed delivery is still switched off at the transport.
            (ActivationState::Active | ActivationState::Failed, false) => {
                self.state = ActivationState::Deactivating;
                Some(ActivationCall::Disable)
            }
            _ => None,
        }
    }

    /// Asks for delivery to be restored after a disconnect.
    pub fn request_reactivation(&mut self) -> Reactivation {
        if !self.is_wanted() {
            return Reactivation::NotWanted;
        }
        match self.state {
            ActivationState::Active => Reactivation::AlreadyActive,
            ActivationState::Activating => {
                self.in_flight.for_recovery = true;
                Reactivation::Joined
            }
            ActivationState::Deactivating => {
                self.recovery_after_disable = true;
                Reactivation::Deferred
            }
            ActivationState::Inactive | ActivationState::Failed => {
                self.state = ActivationState::Activating;
                self.in_flight = InFlight {
                    for_subscribers: false,
                    for_recovery: true,
                };
                Reactivation::Started
            }
        }
    }

    pub fn on_enable_complete(&mut self, result: Result<(), TransportError>) -> EnableOutcome {
        let flight = std::mem::take(&mut self.in_flight);
        self.state = match result {
            Ok(()) => ActivationState::Active,
            Err(_) => ActivationState::Failed,
        };
        // A failed enable is not retried here; only a new subscription or a
        // recovery attempt starts another one.
        let next = if self.is_wanted() {
            None
        } else {
            self.state = ActivationState::Deactivating;
            Some(ActivationCall::Disable)
        };
        EnableOutcome {
            result,
            for_subscribers: flight.for_subscribers,
            for_recovery: flight.for_recovery,
            next,
        }
    }

    pub fn on_disable_complete(&mut self, result: Result<(), TransportError>) -> DisableOutcome {
        self.state = ActivationState::Inactive;
        let next = if self.is_wanted() {
            self.state = ActivationState::Activating;
            self.in_flight = InFlight {
                for_subscribers: true,
                for_recovery: std::mem::take(&mut self.recovery_after_disable),
            };
            Some(ActivationCall::Enable)
        } else {
            self.recovery_after_disable = false;
            None
        };
        DisableOutcome { result, next }
    }

    /// Records a transport disconnect. Returns whether delivery is still expected.
    pub fn on_disconnect(&mut self) -> bool {
        if self.state == ActivationState::Active {
            self.state = ActivationState::Failed;
        }
        self.is_wanted()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake() -> TransportError {
        TransportError::other("fake")
    }

    #[test]
    fn first_subscriber_enables_once() {
        let mut manager = FeatureActivationManager::new();
        let (a, b) = (SubscriberId::new(), SubscriberId::new());
        assert_eq!(manager.subscribe(a), Some(ActivationCall::Enable));
        assert_eq!(manager.subscribe(b), None);
        assert_eq!(manager.state(), ActivationState::Activating);

        let outcome = manager.on_enable_complete(Ok(()));
        assert!(outcome.for_subscribers);
        assert!(!outcome.for_recovery);
        assert_eq!(outcome.next, None);
        assert_eq!(manager.state(), ActivationState::Active);
    }

    #[test]
    fn last_unsubscribe_disables() {
        let mut manager = FeatureActivationManager::new();
        let (a, b) = (SubscriberId::new(), SubscriberId::new());
        manager.subscribe(a);
        manager.subscribe(b);
        manager.on_enable_complete(Ok(()));

        assert_eq!(manager.unsubscribe(a), None);
        assert_eq!(manager.unsubscribe(b), Some(ActivationCall::Disable));
        let outcome = manager.on_disable_complete(Ok(()));
        assert_eq!(outcome.next, None);
        assert_eq!(manager.state(), ActivationState::Inactive);
    }

    #[test]
    fn unknown_unsubscribe_is_ignored() {
        let mut manager = FeatureActivationManager::new();
        assert_eq!(manager.unsubscribe(SubscriberId::new()), None);
        assert_eq!(manager.state(), ActivationState::Inactive);
    }

    #[test]
    fn unsubscribe_during_enable_disables_after_completion() {
        let mut manager = FeatureActivationManager::new();
        let a = SubscriberId::new();
        manager.subscribe(a);
        assert_eq!(manager.unsubscribe(a), None);

        let outcome = manager.on_enable_complete(Ok(()));
        assert_eq!(outcome.next, Some(ActivationCall::Disable));
        assert_eq!(manager.state(), ActivationState::Deactivating);
    }

    #[test]
    fn resubscribe_during_disable_enables_after_completion() {
        let mut manager = FeatureActivationManager::new();
        let (a, b) = (SubscriberId::new(), SubscriberId::new());
        manager.subscribe(a);
        manager.on_enable_complete(Ok(()));
        manager.unsubscribe(a);
        assert_eq!(manager.subscribe(b), None);

        let outcome = manager.on_disable_complete(Ok(()));
        assert_eq!(outcome.next, Some(ActivationCall::Enable));
        assert_eq!(manager.state(), ActivationState::Activating);
    }

    #[test]
    fn failed_enable_is_not_retried_automatically() {
        let mut manager = FeatureActivationManager::new();
        manager.subscribe(SubscriberId::new());
        let outcome = manager.on_enable_complete(Err(fake()));
        assert_eq!(outcome.result, Err(fake()));
        assert_eq!(outcome.next, None);
        assert_eq!(manager.state(), ActivationState::Failed);
    }

    #[test]
    fn failed_disable_leaves_state_inactive() {
        let mut manager = FeatureActivationManager::new();
        let a = SubscriberId::new();
        manager.subscribe(a);
        manager.on_enable_complete(Ok(()));
        manager.unsubscribe(a);
        let outcome = manager.on_disable_complete(Err(fake()));
        assert!(outcome.result.is_err());
        assert_eq!(manager.state(), ActivationState::Inactive);
    }

    #[test]
    fn recovery_joins_in_flight_enable() {
        let mut manager = FeatureActivationManager::new();
        manager.subscribe(SubscriberId::new());
        assert_eq!(manager.request_reactivation(), Reactivation::Joined);

        let outcome = manager.on_enable_complete(Ok(()));
        assert!(outcome.for_subscribers);
        assert!(outcome.for_recovery);
    }

    #[test]
    fn recovery_after_disconnect_starts_enable() {
        let mut manager = FeatureActivationManager::new();
        manager.subscribe(SubscriberId::new());
        manager.on_enable_complete(Ok(()));

        assert!(manager.on_disconnect());
        assert_eq!(manager.state(), ActivationState::Failed);
        assert_eq!(manager.request_reactivation(), Reactivation::Started);

        let outcome = manager.on_enable_complete(Ok(()));
        assert!(!outcome.for_subscribers);
        assert!(outcome.for_recovery);
        assert_eq!(manager.state(), ActivationState::Active);
    }

    #[test]
    fn recovery_during_disable_rides_the_follow_up_enable() {
        let mut manager = FeatureActivationManager::new();
        let (a, b) = (SubscriberId::new(), SubscriberId::new());
        manager.subscribe(a);
        manager.on_enable_complete(Ok(()));
        manager.unsubscribe(a);
        manager.subscribe(b);
        assert_eq!(manager.request_reactivation(), Reactivation::Deferred);

        let disabled = manager.on_disable_complete(Ok(()));
        assert_eq!(disabled.next, Some(ActivationCall::Enable));
        let enabled = manager.on_enable_complete(Ok(()));
        assert!(enabled.for_recovery);
    }

    #[test]
    fn recovery_is_not_wanted_without_subscribers() {
        let mut manager = FeatureActivationManager::new();
        assert!(!manager.on_disconnect());
        assert_eq!(manager.request_reactivation(), Reactivation::NotWanted);
    }

    #[test]
    fn unsubscribe_after_lost_delivery_still_disables() {
        let mut manager = FeatureActivationManager::new();
        let a = SubscriberId::new();
        manager.subscribe(a);
        manager.on_enable_complete(Ok(()));
        manager.on_disconnect();
        assert_eq!(manager.unsubscribe(a), Some(ActivationCall::Disable));
        assert_eq!(manager.state(), ActivationState::Deactivating);
        manager.on_disable_complete(Ok(()));
        assert_eq!(manager.state(), ActivationState::Inactive);
        assert_eq!(manager.request_reactivation(), Reactivation::NotWanted);
    }

    #[test]
    fn unsubscribe_during_failed_enable_still_disables() {
        let mut manager = FeatureActivationManager::new();
        let a = SubscriberId::new();
        manager.subscribe(a);
        manager.unsubscribe(a);
        let outcome = manager.on_enable_complete(Err(fake()));
        assert_eq!(outcome.next, Some(ActivationCall::Disable));
        assert_eq!(manager.state(), ActivationState::Deactivating);
    }
}
