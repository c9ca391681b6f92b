use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use super::StateMachine;
use crate::rsocket_lite::client::RetryPolicy;

/// Lifecycle state of a client session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Handshaking,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Handshaking => "handshaking",
            ConnectionState::Connected => "connected",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleInput {
    /// The caller asked for a fresh session.
    Connect,
    /// A transport was dialed successfully.
    TransportReady,
    /// The server accepted the setup or resume frame.
    HandshakeAccepted,
    /// The server refused to resume the session.
    ResumptionRejected,
    /// Dialing or handshaking failed for any other reason.
    ConnectFailed,
    /// An established transport broke.
    TransportLost,
    /// The resume timeout passed without re-establishing the session.
    ResumeWindowElapsed,
    /// The server closed the connection or refused the handshake for good.
    Fatal,
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleOutput {
    /// Wait `delay`, dial a transport and handshake. `resume` selects a resume frame for the
    /// current session instead of a setup frame for a new one.
    Dial { resume: bool, delay: Duration },
    Established { resumed: bool },
    Failed(LifecycleFailure),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleFailure {
    Unreachable,
    RejectionsExhausted { attempts: u32 },
    ResumeWindowElapsed,
    Fatal,
}

/// Pure connection lifecycle: `Disconnected → Connecting → Handshaking → Connected`.
///
/// Resumption rejections loop back to `Connecting` with a fresh session at most
/// [`RetryPolicy::max_attempts`] times in a row. Transport loss while connected loops back to
/// `Connecting` in resume mode, where dial failures are retried with backoff until the runner
/// reports [`LifecycleInput::ResumeWindowElapsed`].
#[derive(Debug)]
pub struct LifecycleMachine {
    state: ConnectionState,
    policy: RetryPolicy,
    resuming: bool,
    rejections: u32,
    failures: u32,
    pending: VecDeque<LifecycleOutput>,
}

impl LifecycleMachine {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            policy,
            resuming: false,
            rejections: 0,
            failures: 0,
            pending: VecDeque::new(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Number of consecutive resumption rejections in the current episode.
    pub fn rejections(&self) -> u32 {
        self.rejections
    }

    fn connect(&mut self) {
        if self.state != ConnectionState::Disconnected {
            return;
        }
        self.resuming = false;
        self.rejections = 0;
        self.failures = 0;
        self.pending.clear();
        self.state = ConnectionState::Connecting;
        self.pending.push_back(LifecycleOutput::Dial {
            resume: false,
            delay: Duration::ZERO,
        });
    }

    fn transport_ready(&mut self) {
        if self.state == ConnectionState::Connecting {
            self.state = ConnectionState::Handshaking;
        }
    }

    fn handshake_accepted(&mut self) {
        if self.state != ConnectionState::Handshaking {
            return;
        }
        self.state = ConnectionState::Connected;
        self.pending.push_back(LifecycleOutput::Established {
            resumed: self.resuming,
        });
        self.resuming = false;
        self.rejections = 0;
        self.failures = 0;
    }

    fn resumption_rejected(&mut self) {
        if !matches!(
            self.state,
            ConnectionState::Handshaking | ConnectionState::Connected
        ) {
            return;
        }
        self.resuming = false;
        self.rejections += 1;

        if self.rejections > self.policy.max_attempts {
            self.state = ConnectionState::Disconnected;
            self.pending
                .push_back(LifecycleOutput::Failed(LifecycleFailure::RejectionsExhausted {
                    attempts: self.rejections,
                }));
            return;
        }

        self.state = ConnectionState::Connecting;
        self.pending.push_back(LifecycleOutput::Dial {
            resume: false,
            delay: self.policy.backoff(self.rejections - 1),
        });
    }

    fn connect_failed(&mut self) {
        if !matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::Handshaking
        ) {
            return;
        }

        if !self.resuming {
            self.state = ConnectionState::Disconnected;
            self.pending
                .push_back(LifecycleOutput::Failed(LifecycleFailure::Unreachable));
            return;
        }

        self.failures += 1;
        self.state = ConnectionState::Connecting;
        self.pending.push_back(LifecycleOutput::Dial {
            resume: true,
            delay: self.policy.backoff(self.failures - 1),
        });
    }

    fn transport_lost(&mut self) {
        if self.state != ConnectionState::Connected {
            return;
        }
        self.resuming = true;
        self.failures = 0;
        self.state = ConnectionState::Connecting;
        self.pending.push_back(LifecycleOutput::Dial {
            resume: true,
            delay: Duration::ZERO,
        });
    }

    fn fail(&mut self, failure: LifecycleFailure) {
        self.state = ConnectionState::Disconnected;
        self.resuming = false;
        self.pending.clear();
        self.pending.push_back(LifecycleOutput::Failed(failure));
    }

    fn shutdown(&mut self) {
        self.state = ConnectionState::Disconnected;
        self.resuming = false;
        self.pending.clear();
    }
}

impl StateMachine for LifecycleMachine {
    type Input = LifecycleInput;
    type Output = LifecycleOutput;

    fn process_input(&mut self, input: Self::Input) {
        match input {
            LifecycleInput::Connect => self.connect(),
            LifecycleInput::TransportReady => self.transport_ready(),
            LifecycleInput::HandshakeAccepted => self.handshake_accepted(),
            LifecycleInput::ResumptionRejected => self.resumption_rejected(),
            LifecycleInput::ConnectFailed => self.connect_failed(),
            LifecycleInput::TransportLost => self.transport_lost(),
            LifecycleInput::ResumeWindowElapsed => {
                if matches!(
                    self.state,
                    ConnectionState::Connecting | ConnectionState::Handshaking
                ) {
                    self.fail(LifecycleFailure::ResumeWindowElapsed);
                }
            }
            LifecycleInput::Fatal => {
                if self.state != ConnectionState::Disconnected {
                    self.fail(LifecycleFailure::Fatal);
                }
            }
            LifecycleInput::Shutdown => self.shutdown(),
        }
    }

    fn poll_output(&mut self) -> Option<Self::Output> {
        self.pending.pop_front()
    }
}
