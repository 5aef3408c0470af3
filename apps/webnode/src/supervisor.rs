//! Lifecycle orchestration.
//!
//! The supervisor logs in once, then loops: refresh the access token, announce
//! the node, open the socket and watch it until it ends. Every pass starts
//! from a fresh access token; the previous one is invalidated before the
//! refresh so it can never reach a new socket.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::auth::{self, AccessCredential, TokenManager};
use crate::config::NodeConfig;
use crate::error::SessionError;
use crate::gate::TaskGateClient;
use crate::identity::{ClientMetadata, Identity};
use crate::register::RegistrationClient;
use crate::session::{self, PointsObserver, SessionEnd, SessionSettings};

/// Where the supervisor currently is in the lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unauthenticated,
    Registered,
    Connected,
    Faulted,
    /// `run` has returned; no further transitions happen.
    Terminated,
}

/// Cloneable remote control for a running [`Supervisor`].
#[derive(Debug, Clone)]
pub struct SupervisorHandle {
    state: watch::Receiver<SessionState>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl SupervisorHandle {
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    /// Closes the open socket (if any) and makes `run` return `Ok(())`.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }
}

enum Pass {
    Shutdown,
    /// The socket reached CONNECTED and later ended.
    Disconnected(SessionEnd),
    /// The pass failed before reaching CONNECTED; worth retrying.
    Failed(SessionError),
}

enum Acquired {
    Token(AccessCredential),
    Retry(SessionError),
    Shutdown,
}

pub struct Supervisor {
    config: NodeConfig,
    identity: Identity,
    gate: TaskGateClient,
    registrar: RegistrationClient,
    settings: SessionSettings,
    observer: Arc<dyn PointsObserver>,
    state_tx: watch::Sender<SessionState>,
    state_rx: watch::Receiver<SessionState>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Supervisor {
    pub fn new(
        config: NodeConfig,
        identity: Identity,
        observer: Arc<dyn PointsObserver>,
    ) -> Result<Self, SessionError> {
        config.validate()?;
        let metadata = ClientMetadata::from_config(&config);
        let gate = TaskGateClient::new(&config, &metadata)?;
        let registrar = RegistrationClient::new(gate.clone(), metadata.clone());
        let settings = SessionSettings::new(&config, &metadata);
        let (state_tx, state_rx) = watch::channel(SessionState::Unauthenticated);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Ok(Self {
            config,
            identity,
            gate,
            registrar,
            settings,
            observer,
            state_tx,
            state_rx,
            shutdown_tx: Arc::new(shutdown_tx),
            shutdown_rx,
        })
    }

    pub fn handle(&self) -> SupervisorHandle {
        SupervisorHandle {
            state: self.state_rx.clone(),
            shutdown: self.shutdown_tx.clone(),
        }
    }

    /// Runs until shutdown is requested (`Ok`) or the lifecycle cannot continue.
    pub async fn run(self) -> Result<(), SessionError> {
        info!(
            target: "webnode::supervisor",
            device_id = %self.identity.device_id(),
            api = %self.config.api_base,
            "starting node lifecycle"
        );
        let result = self.lifecycle().await;
        match &result {
            Ok(()) => info!(target: "webnode::supervisor", "node lifecycle stopped"),
            Err(err) => error!(target: "webnode::supervisor", error = %err, "node lifecycle terminated"),
        }
        self.transition(SessionState::Terminated);
        result
    }

    async fn lifecycle(&self) -> Result<(), SessionError> {
        self.transition(SessionState::Unauthenticated);
        let refresh = match self.guarded(auth::exchange(&self.gate, &self.identity)).await {
            None => return Ok(()),
            Some(result) => result.map_err(SessionError::Login)?,
        };
        let mut tokens = TokenManager::new(self.gate.clone(), refresh);

        let mut failures: u32 = 0;
        let mut refresh_failures: u32 = 0;
        let mut initial = true;
        loop {
            let pass = self
                .pass(&mut tokens, initial, &mut refresh_failures)
                .await?;
            initial = false;

            let cause = match pass {
                Pass::Shutdown => return Ok(()),
                Pass::Disconnected(end) => {
                    failures = 0;
                    match end {
                        SessionEnd::Closed(reason) => SessionError::Closed(reason),
                        SessionEnd::Faulted(err) => SessionError::Transport(err),
                    }
                }
                Pass::Failed(err) => {
                    failures += 1;
                    err
                }
            };
            self.transition(SessionState::Faulted);

            if !self.config.retry.allows(failures) {
                return Err(SessionError::RetriesExhausted {
                    attempts: failures,
                    last: Box::new(cause),
                });
            }

            let delay = self.config.retry.delay_for(failures + 1);
            warn!(
                target: "webnode::supervisor",
                error = %cause,
                failures,
                delay_ms = delay.as_millis() as u64,
                "session lost; reconnecting after backoff"
            );
            if self.guarded(sleep(delay)).await.is_none() {
                return Ok(());
            }
        }
    }

    /// One refresh → register → connect → observe pass. `Err` is fatal.
    async fn pass(
        &self,
        tokens: &mut TokenManager,
        initial: bool,
        refresh_failures: &mut u32,
    ) -> Result<Pass, SessionError> {
        self.transition(SessionState::Unauthenticated);
        tokens.invalidate();

        let access = match self.acquire_access(tokens, initial, refresh_failures).await? {
            Acquired::Token(access) => access,
            Acquired::Retry(err) => return Ok(Pass::Failed(err)),
            Acquired::Shutdown => return Ok(Pass::Shutdown),
        };

        match self
            .guarded(self.registrar.announce(&access, &self.identity))
            .await
        {
            None => return Ok(Pass::Shutdown),
            Some(Ok(())) => {}
            Some(Err(err)) if self.config.require_registration => {
                return Ok(Pass::Failed(SessionError::Registration(err)));
            }
            Some(Err(err)) => {
                warn!(
                    target: "webnode::supervisor",
                    error = %err,
                    "registration failed; opening socket anyway"
                );
            }
        }
        self.transition(SessionState::Registered);

        let opened = self
            .guarded(session::open(
                &self.settings,
                &access,
                &self.identity,
                self.observer.clone(),
            ))
            .await;
        let mut handle = match opened {
            None => return Ok(Pass::Shutdown),
            Some(Err(err)) => return Ok(Pass::Failed(SessionError::Transport(err))),
            Some(Ok(handle)) => handle,
        };
        self.transition(SessionState::Connected);

        let mut shutdown = self.shutdown_rx.clone();
        let ended = tokio::select! {
            end = handle.finished() => Some(end),
            _ = wait_for_shutdown(&mut shutdown) => None,
        };
        match ended {
            Some(end) => Ok(Pass::Disconnected(end)),
            None => {
                let end = handle.close().await;
                debug!(target: "webnode::supervisor", ?end, "socket closed for shutdown");
                Ok(Pass::Shutdown)
            }
        }
    }

    /// Refreshes the access token. Transport failures are retried through the
    /// reconnect loop until `max_refresh_failures` in a row, then become fatal.
    async fn acquire_access(
        &self,
        tokens: &mut TokenManager,
        initial: bool,
        refresh_failures: &mut u32,
    ) -> Result<Acquired, SessionError> {
        let mut relogged = false;
        loop {
            let err = match self.guarded(tokens.refresh()).await {
                None => return Ok(Acquired::Shutdown),
                Some(Ok(access)) => {
                    *refresh_failures = 0;
                    return Ok(Acquired::Token(access));
                }
                Some(Err(err)) => err,
            };
            if initial {
                return Err(SessionError::Refresh(err));
            }
            if !err.is_rejection() {
                *refresh_failures += 1;
                if *refresh_failures >= self.config.max_refresh_failures {
                    warn!(
                        target: "webnode::supervisor",
                        error = %err,
                        failures = *refresh_failures,
                        "token refresh keeps failing; giving up"
                    );
                    return Err(SessionError::Refresh(err));
                }
                return Ok(Acquired::Retry(SessionError::Refresh(err)));
            }
            if !self.config.relogin_on_rejected_refresh || relogged {
                return Err(SessionError::Refresh(err));
            }

            warn!(
                target: "webnode::supervisor",
                error = %err,
                "refresh token rejected; exchanging account credentials again"
            );
            relogged = true;
            match self.guarded(auth::exchange(&self.gate, &self.identity)).await {
                None => return Ok(Acquired::Shutdown),
                Some(Ok(refresh)) => tokens.replace_refresh(refresh),
                Some(Err(login)) => return Err(SessionError::Login(login)),
            }
        }
    }

    /// Runs `fut` unless shutdown is requested first.
    async fn guarded<F: Future>(&self, fut: F) -> Option<F::Output> {
        let mut shutdown = self.shutdown_rx.clone();
        tokio::select! {
            out = fut => Some(out),
            _ = wait_for_shutdown(&mut shutdown) => None,
        }
    }

    fn transition(&self, next: SessionState) {
        let previous = self.state_tx.send_replace(next);
        if previous != next {
            debug!(target: "webnode::supervisor", from = ?previous, to = ?next, "state transition");
        }
    }
}

async fn wait_for_shutdown(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

