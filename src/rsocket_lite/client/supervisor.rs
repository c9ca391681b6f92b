//! Runs the lifecycle state machine against real transports.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

use crate::rsocket_lite::client::config::SessionConfig;
use crate::rsocket_lite::client::manager::ConnectionEvent;
use crate::rsocket_lite::error::{ConnectionError, ResumptionRejected, TransportError};
use crate::rsocket_lite::frame::{Frame, FrameType, error_code};
use crate::rsocket_lite::session::SessionToken;
use crate::rsocket_lite::transport::{Connector, FrameTransport};
use crate::state_machine::StateMachine;
use crate::state_machine::lifecycle::{
    ConnectionState, LifecycleFailure, LifecycleInput, LifecycleMachine, LifecycleOutput,
};

enum DialError {
    Rejected(ResumptionRejected),
    Transport(TransportError),
}

impl From<TransportError> for DialError {
    fn from(e: TransportError) -> Self {
        DialError::Transport(e)
    }
}

pub(crate) struct Supervisor {
    connector: Arc<dyn Connector>,
    config: SessionConfig,
    machine: LifecycleMachine,
    token: Arc<Mutex<SessionToken>>,
    state: watch::Sender<ConnectionState>,
    events: broadcast::Sender<ConnectionEvent>,
}

impl Supervisor {
    pub(crate) fn new(
        connector: Arc<dyn Connector>,
        config: SessionConfig,
        events: broadcast::Sender<ConnectionEvent>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            machine: LifecycleMachine::new(config.retry),
            connector,
            config,
            token: Arc::new(Mutex::new(SessionToken::generate())),
            state,
            events,
        }
    }

    pub(crate) fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub(crate) fn token(&self) -> SessionToken {
        self.token.lock().expect("session token lock poisoned").clone()
    }

    pub(crate) fn shared_token(&self) -> Arc<Mutex<SessionToken>> {
        self.token.clone()
    }

    pub(crate) fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub(crate) fn rejections(&self) -> u32 {
        self.machine.rejections()
    }

    pub(crate) fn emit(&self, event: ConnectionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Feed the machine and publish the resulting state.
    pub(crate) fn feed(&mut self, input: LifecycleInput) {
        self.machine.process_input(input);
        self.state.send_replace(self.machine.state());
    }

    /// Drop any queued outputs, returning the last failure among them.
    pub(crate) fn drain(&mut self) -> Option<LifecycleFailure> {
        let mut failure = None;
        while let Some(output) = self.machine.poll_output() {
            if let LifecycleOutput::Failed(f) = output {
                failure = Some(f);
            }
        }
        failure
    }

    /// Execute the machine's dial instructions until it reports an established session or a
    /// failure.
    ///
    /// Returns the handshaken transport and whether the previous session was resumed.
    pub(crate) async fn establish(&mut self) -> Result<(FrameTransport, bool), ConnectionError> {
        let mut ready = None;
        let mut last_error = None;

        while let Some(output) = self.machine.poll_output() {
            match output {
                LifecycleOutput::Dial { resume, delay } => {
                    if !delay.is_zero() {
                        let delay_ms = delay.as_millis() as u64;
                        debug!(delay_ms, resume, "Backing off before dial");
                        tokio::time::sleep(delay).await;
                    }

                    match self.dial(resume).await {
                        Ok(io) => {
                            ready = Some(io);
                            self.feed(LifecycleInput::HandshakeAccepted);
                        }
                        Err(DialError::Rejected(rejection)) => {
                            self.feed(LifecycleInput::ResumptionRejected);
                            warn!(
                                token = %rejection.token,
                                attempt = self.rejections(),
                                reason = %rejection.message,
                                "Server rejected session resumption, starting a fresh session"
                            );
                            self.emit(ConnectionEvent::ResumptionRejected {
                                token: rejection.token,
                                attempt: self.rejections(),
                            });
                        }
                        Err(DialError::Transport(e @ TransportError::Rejected { .. })) => {
                            error!(error = %e, resume, "Server refused the handshake");
                            last_error = Some(e);
                            self.feed(LifecycleInput::Fatal);
                        }
                        Err(DialError::Transport(e)) => {
                            warn!(error = %e, resume, "Connection attempt failed");
                            last_error = Some(e);
                            self.feed(LifecycleInput::ConnectFailed);
                        }
                    }
                }
                LifecycleOutput::Established { resumed } => {
                    let token = self.token();
                    info!(token = %token, resumed, "Session established");
                    self.emit(ConnectionEvent::Connected { token, resumed });
                    return ready
                        .take()
                        .map(|io| (io, resumed))
                        .ok_or(ConnectionError::Shutdown);
                }
                LifecycleOutput::Failed(failure) => {
                    return Err(self.failure(failure, last_error.take()));
                }
            }
        }

        Err(ConnectionError::Shutdown)
    }

    pub(crate) fn failure(
        &self,
        failure: LifecycleFailure,
        cause: Option<TransportError>,
    ) -> ConnectionError {
        match failure {
            LifecycleFailure::Unreachable => {
                ConnectionError::Unreachable(cause.unwrap_or(TransportError::Closed))
            }
            LifecycleFailure::RejectionsExhausted { attempts } => {
                ConnectionError::ResumptionRejected { attempts }
            }
            LifecycleFailure::ResumeWindowElapsed => {
                ConnectionError::ResumeWindowElapsed(self.config.resume_timeout)
            }
            LifecycleFailure::Fatal => match cause {
                Some(TransportError::Rejected { code, message }) => {
                    ConnectionError::ClosedByPeer { code, message }
                }
                _ => ConnectionError::Shutdown,
            },
        }
    }

    /// Open a transport and perform the setup or resume handshake.
    async fn dial(&mut self, resume: bool) -> Result<FrameTransport, DialError> {
        let mut io = self.connector.connect().await?;
        self.feed(LifecycleInput::TransportReady);

        let token = if resume {
            self.token()
        } else {
            let token = SessionToken::generate();
            *self.token.lock().expect("session token lock poisoned") = token.clone();
            token
        };

        let hello = if resume {
            Frame::resume(&token)
        } else {
            Frame::setup(
                &token,
                millis(self.config.resume_timeout),
                millis(self.config.keepalive_interval),
            )
        };
        debug!(token = %token, resume, "Sending handshake");
        io.send(hello).await?;

        let reply = tokio::time::timeout(self.config.handshake_timeout, io.next())
            .await
            .map_err(|_| TransportError::HandshakeTimeout)?
            .ok_or(TransportError::Closed)??;

        match reply.kind() {
            FrameType::SetupOk | FrameType::ResumeOk => Ok(io),
            FrameType::Error if reply.error_code == error_code::REJECTED_RESUME => {
                Err(DialError::Rejected(ResumptionRejected {
                    token,
                    message: reply.error_message(),
                }))
            }
            FrameType::Error => Err(DialError::Transport(TransportError::Rejected {
                code: reply.error_code,
                message: reply.error_message(),
            })),
            other => Err(DialError::Transport(TransportError::UnexpectedFrame(other))),
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
