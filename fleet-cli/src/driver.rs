//! Placeholder `Driver` wiring for `fleetd`. The real browser choreography
//! is an external collaborator (out of scope for this crate — see
//! `fleet_core::driver`); this stub logs what it would have done and always
//! reports `UnexpectedError`, so a deployment can swap in a real
//! implementation of `fleet_core::driver::Driver` without touching the
//! scheduler or supervisor.

use async_trait::async_trait;
use fleet_core::classifier::Outcome;
use fleet_core::driver::{Driver, Session};
use fleet_core::error::DriverError;
use fleet_core::model::Profile;
use tracing::warn;

pub struct LoggingStubSession;
impl Session for LoggingStubSession {}

pub struct LoggingStubDriver;

#[async_trait]
impl Driver for LoggingStubDriver {
    type Session = LoggingStubSession;

    async fn open(&self, profile: &Profile, proxy_url: &str) -> Result<Self::Session, DriverError> {
        warn!(
            profile_id = %profile.profile_id,
            proxy_url,
            "no browser driver wired up, opening a stub session"
        );
        Ok(LoggingStubSession)
    }

    async fn send_action(
        &self,
        _session: &Self::Session,
        chat_ref: &str,
        text: &str,
    ) -> Result<Outcome, DriverError> {
        warn!(chat_ref, text, "stub driver cannot actually send, reporting unexpected_error");
        Ok(Outcome::UnexpectedError)
    }

    async fn close(&self, _session: Self::Session) {}
}
