//! Pure state machine for the reload controller

/// How a requested configuration reload turned out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reloaded {
    /// The configuration could not be read or did not validate.
    Failed,
    /// The configuration equals the one in use.
    Unchanged,
    /// The configuration differs from the one in use.
    Changed,
}

impl Reloaded {
    /// Label value used in self-telemetry.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Reloaded::Failed => "failed",
            Reloaded::Unchanged => "unchanged",
            Reloaded::Changed => "changed",
        }
    }
}

/// Why the live epoch is being drained
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// A reload was requested, the configuration is being read.
    Reloading,
    /// The live epoch is being replaced by one for a changed configuration.
    Swapping,
    /// The epoch is being stopped and unregistered.
    Stopping {
        /// Whether the controller exits once the epoch is gone, rather than
        /// starting the next one.
        exit: bool,
    },
}

/// The state of the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// A configuration is being loaded or an epoch started for it.
    Loading,
    /// An epoch is live, waiting for a reload request or shutdown.
    Running,
    /// The live epoch is being reconsidered or torn down.
    Draining {
        /// What the drain is for
        phase: Phase,
    },
    /// Terminal state
    Terminated,
}

/// Operations the state machine can request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Start an epoch for the current configuration.
    StartEpoch,
    /// Wait for a reload request or shutdown.
    Wait,
    /// Read the configuration again and compare it with the current one.
    ReloadConfig,
    /// Stop the live epoch, wait for its loops and unregister it.
    StopEpoch,
    /// Stop the live epoch, wait for its loops and hand its families over to
    /// a new epoch for the changed configuration in one step.
    SwapEpoch,
    /// Exit cleanly.
    Exit,
    /// Exit with the error that caused the last event.
    Fail,
}

/// Events that can drive the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// The initial configuration was read, success denoted by boolean.
    Loaded {
        /// Whether a valid configuration is available
        success: bool,
    },
    /// An epoch start was attempted, success denoted by boolean.
    EpochStarted {
        /// Whether the epoch's families are live and its loops spawned
        success: bool,
    },
    /// A reload request arrived.
    ReloadRequested,
    /// Shutdown signal received.
    ShutdownSignaled,
    /// The configuration was read again.
    ConfigReloaded(Reloaded),
    /// The live epoch was stopped and replaced, success denoted by boolean.
    EpochSwapped {
        /// Whether the new epoch's families are live and its loops spawned
        success: bool,
    },
    /// The live epoch's loops have returned and its families were
    /// unregistered, success denoted by boolean.
    EpochDrained {
        /// Whether every family was unregistered
        unregistered: bool,
    },
}

/// Errors produced by [`StateMachine`]
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Transition is not valid
    #[error("Invalid transition from {from:?} via {via:?}")]
    InvalidTransition {
        /// State the machine was in
        from: State,
        /// Event that was rejected
        via: Event,
    },
}

/// State machine for the reload controller
///
/// This holds the transition logic of the controller without any IO. The
/// controller reads configuration, starts and stops epochs and waits on its
/// signals, feeding each result back in as an [`Event`] and doing whatever
/// [`Operation`] comes out.
#[derive(Debug, Clone)]
pub struct StateMachine {
    state: State,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    /// Create a new state machine
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: State::Loading,
        }
    }

    /// Get the current state
    #[must_use]
    pub fn state(&self) -> &State {
        &self.state
    }

    /// Process an event and return the next operation
    ///
    /// # Errors
    ///
    /// Function will error with `InvalidTransition` if the `event` is not valid
    /// for the present state.
    pub fn next(&mut self, event: Event) -> Result<Operation, Error> {
        let invalid = Error::InvalidTransition {
            from: self.state,
            via: event,
        };
        let (next_state, operation) = match self.state {
            State::Loading => match event {
                Event::Loaded { success: true } => (State::Loading, Operation::StartEpoch),
                Event::EpochStarted { success: true } => (State::Running, Operation::Wait),
                Event::Loaded { success: false } | Event::EpochStarted { success: false } => {
                    (State::Terminated, Operation::Fail)
                }
                Event::ShutdownSignaled => (State::Terminated, Operation::Exit),
                _ => return Err(invalid),
            },
            State::Running => match event {
                Event::ReloadRequested => (
                    State::Draining {
                        phase: Phase::Reloading,
                    },
                    Operation::ReloadConfig,
                ),
                Event::ShutdownSignaled => (
                    State::Draining {
                        phase: Phase::Stopping { exit: true },
                    },
                    Operation::StopEpoch,
                ),
                _ => return Err(invalid),
            },
            // A failed or no-op reload leaves the live epoch untouched.
            State::Draining {
                phase: Phase::Reloading,
            } => match event {
                Event::ConfigReloaded(Reloaded::Failed | Reloaded::Unchanged) => {
                    (State::Running, Operation::Wait)
                }
                Event::ConfigReloaded(Reloaded::Changed) => (
                    State::Draining {
                        phase: Phase::Swapping,
                    },
                    Operation::SwapEpoch,
                ),
                Event::ShutdownSignaled => (
                    State::Draining {
                        phase: Phase::Stopping { exit: true },
                    },
                    Operation::StopEpoch,
                ),
                _ => return Err(invalid),
            },
            // A shutdown arriving mid swap is seen once the swap is done.
            State::Draining {
                phase: Phase::Swapping,
            } => match event {
                Event::EpochSwapped { success: true } => (State::Running, Operation::Wait),
                Event::EpochSwapped { success: false } => (State::Terminated, Operation::Fail),
                _ => return Err(invalid),
            },
            State::Draining {
                phase: Phase::Stopping { exit },
            } => match event {
                Event::EpochDrained { unregistered: true } if exit => {
                    (State::Terminated, Operation::Exit)
                }
                Event::EpochDrained { unregistered: true } => {
                    (State::Loading, Operation::StartEpoch)
                }
                Event::EpochDrained {
                    unregistered: false,
                } => (State::Terminated, Operation::Fail),
                _ => return Err(invalid),
            },
            State::Terminated => return Err(invalid),
        };

        self.state = next_state;
        Ok(operation)
    }
}
