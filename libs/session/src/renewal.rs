use std::time::Duration;

use hdc_core::{Credential, CredentialKind};
use time::OffsetDateTime;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Tracks when the next credential renewal is due. Only renewable credentials
/// are ever armed.
#[derive(Debug)]
pub struct RenewalScheduler {
    kind: Option<CredentialKind>,
    margin: Duration,
    retry_interval: Duration,
    deadline: Option<Instant>,
}

impl RenewalScheduler {
    pub fn new(kind: Option<CredentialKind>, margin: Duration, retry_interval: Duration) -> Self {
        Self {
            kind,
            margin,
            retry_interval,
            deadline: None,
        }
    }

    pub fn is_renewable(&self) -> bool {
        self.kind == Some(CredentialKind::Renewable)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Arms the timer from the credential's expiry. Returns the delay when armed.
    pub fn arm_for(
        &mut self,
        credential: &Credential,
        wall_now: OffsetDateTime,
        now: Instant,
    ) -> Option<Duration> {
        if !self.is_renewable() {
            return None;
        }
        let token = credential.sas_token()?;
        let mut delay = token.time_until_renewal(wall_now, self.margin);
        if delay < self.retry_interval {
            // Token lifetime does not cover the margin; renew halfway through
            // what is left instead.
            let remaining = token.remaining(wall_now);
            delay = (remaining / 2).max(self.retry_interval);
            warn!(
                remaining_secs = remaining.as_secs(),
                margin_secs = self.margin.as_secs(),
                delay_secs = delay.as_secs(),
                "token expires too soon for renewal margin"
            );
        }
        debug!(delay_secs = delay.as_secs(), "credential renewal armed");
        self.deadline = Some(now + delay);
        Some(delay)
    }

    /// Re-arms after a failed renewal.
    pub fn arm_retry(&mut self, now: Instant) -> Option<Duration> {
        if !self.is_renewable() {
            return None;
        }
        self.deadline = Some(now + self.retry_interval);
        Some(self.retry_interval)
    }

    /// Consumes the deadline when the timer fires.
    pub fn fire(&mut self) -> bool {
        self.deadline.take().is_some()
    }

    pub fn cancel(&mut self) {
        self.deadline = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hdc_core::{SasToken, X509Identity};

    #[test]
    fn sas_token_arms_ahead_of_expiry() {
        let mut scheduler = RenewalScheduler::new(
            Some(CredentialKind::Renewable),
            Duration::from_secs(900),
            Duration::from_secs(15),
        );
        let wall = OffsetDateTime::now_utc();
        let now = Instant::now();
        let credential =
            Credential::SharedAccessSignature(SasToken::new("sig", wall + Duration::from_secs(3600)));
        assert_eq!(
            scheduler.arm_for(&credential, wall, now),
            Some(Duration::from_secs(2700))
        );
        assert_eq!(scheduler.deadline(), Some(now + Duration::from_secs(2700)));
        assert!(scheduler.fire());
        assert!(!scheduler.fire());
    }

    #[test]
    fn short_lived_token_arms_at_half_its_lifetime() {
        let mut scheduler = RenewalScheduler::new(
            Some(CredentialKind::Renewable),
            Duration::from_secs(900),
            Duration::from_secs(15),
        );
        let wall = OffsetDateTime::now_utc();
        let now = Instant::now();
        let short =
            Credential::SharedAccessSignature(SasToken::new("sig", wall + Duration::from_secs(600)));
        assert_eq!(
            scheduler.arm_for(&short, wall, now),
            Some(Duration::from_secs(300))
        );

        let expired = Credential::SharedAccessSignature(SasToken::new("sig", wall));
        assert_eq!(
            scheduler.arm_for(&expired, wall, now),
            Some(Duration::from_secs(15))
        );
    }

    #[test]
    fn non_renewable_never_arms() {
        let mut scheduler = RenewalScheduler::new(
            Some(CredentialKind::NonRenewable),
            Duration::from_secs(900),
            Duration::from_secs(15),
        );
        let credential = Credential::X509(X509Identity::new("CERT", "KEY"));
        assert_eq!(
            scheduler.arm_for(&credential, OffsetDateTime::now_utc(), Instant::now()),
            None
        );
        assert_eq!(scheduler.arm_retry(Instant::now()), None);
        assert_eq!(scheduler.deadline(), None);
    }
}
