//! The Driver seam (§6 "Driver (consumed)"): the only place the core talks
//! to the outside world. The actual browser choreography is explicitly out
//! of scope (§1); this crate only defines the contract and a scripted
//! in-memory double for tests.

use async_trait::async_trait;

use crate::classifier::Outcome;
use crate::error::DriverError;
use crate::model::Profile;

/// An opaque handle to an open driver session, returned by `open` and
/// consumed by `send_action`/`close`. The core never inspects it.
pub trait Session: Send + Sync {}

#[async_trait]
pub trait Driver: Send + Sync {
    type Session: Session;

    async fn open(&self, profile: &Profile, proxy_url: &str) -> Result<Self::Session, DriverError>;

    async fn send_action(
        &self,
        session: &Self::Session,
        chat_ref: &str,
        text: &str,
    ) -> Result<Outcome, DriverError>;

    async fn close(&self, session: Self::Session);
}

/// A scripted test double: each call to `open` hands out the next canned
/// session result, and each call to `send_action` hands out the next canned
/// outcome, in order. Exhausting the script is a test bug, not a driver
/// fault, so it panics rather than returning `UnexpectedError`.
pub mod scripted {
    use super::*;
    use std::sync::Mutex;

    pub struct ScriptedSession(pub u64);
    impl Session for ScriptedSession {}

    pub struct ScriptedDriver {
        opens: Mutex<std::collections::VecDeque<Result<(), String>>>,
        outcomes: Mutex<std::collections::VecDeque<Outcome>>,
        next_session_id: Mutex<u64>,
    }

    impl ScriptedDriver {
        pub fn new(opens: Vec<Result<(), String>>, outcomes: Vec<Outcome>) -> Self {
            Self {
                opens: Mutex::new(opens.into_iter().collect()),
                outcomes: Mutex::new(outcomes.into_iter().collect()),
                next_session_id: Mutex::new(0),
            }
        }

        pub fn always_success(count: usize) -> Self {
            Self::new(
                vec![Ok(()); count],
                std::iter::repeat(Outcome::Success).take(count).collect(),
            )
        }
    }

    #[async_trait]
    impl Driver for ScriptedDriver {
        type Session = ScriptedSession;

        async fn open(
            &self,
            _profile: &Profile,
            _proxy_url: &str,
        ) -> Result<Self::Session, DriverError> {
            let next = self
                .opens
                .lock()
                .unwrap()
                .pop_front()
                .expect("scripted driver: open() called more times than scripted");
            match next {
                Ok(()) => {
                    let mut id = self.next_session_id.lock().unwrap();
                    *id += 1;
                    Ok(ScriptedSession(*id))
                }
                Err(reason) => Err(DriverError::OpenFailed(reason)),
            }
        }

        async fn send_action(
            &self,
            _session: &Self::Session,
            _chat_ref: &str,
            _text: &str,
        ) -> Result<Outcome, DriverError> {
            let outcome = self
                .outcomes
                .lock()
                .unwrap()
                .pop_front()
                .expect("scripted driver: send_action() called more times than scripted");
            Ok(outcome)
        }

        async fn close(&self, _session: Self::Session) {}
    }
}
