//! Connection State Machine
//!
//! Defines valid session transitions and the side effects each one requires.
//! The machine is pure: it never touches a socket or a timer, it only tells
//! its owner which [`Directive`]s to carry out.

use std::fmt;
use std::time::Duration;

use crate::policy::{ReconnectDecision, ReconnectPolicy};

/// Lifecycle state of one logical subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    #[default]
    Idle,
    Connecting,
    Open,
    Closing,
    Reconnecting,
    Stopped,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Idle => "Idle",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Open => "Open",
            ConnectionState::Closing => "Closing",
            ConnectionState::Reconnecting => "Reconnecting",
            ConnectionState::Stopped => "Stopped",
        };
        f.write_str(name)
    }
}

/// Inputs that can trigger state transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// Caller asked to connect
    Connect,
    /// The live channel completed its handshake
    ChannelOpened,
    /// The live channel failed to open, errored, or was closed by the remote side
    ChannelLost,
    /// The pending reconnect timer elapsed
    TimerFired,
    /// Caller asked to disconnect
    Disconnect,
    /// The channel being closed has released its connection
    ChannelReleased,
}

/// Side effects the owner must perform, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    /// Start a fresh logical session (resolve the URL, reset counters)
    BeginSession,
    /// Open a new channel to the session URL
    OpenChannel,
    /// Close the live channel and wait for it to finish
    CloseChannel,
    /// Arm the reconnect timer, replacing any pending one
    ScheduleReconnect { attempt: u32, delay: Duration },
    /// Drop the pending reconnect timer
    CancelReconnect,
    /// Remove registered observers
    ClearObservers,
    /// Run the on-open hook
    NotifyOpened,
    /// Report that the policy gave up after `attempts` reconnects
    GiveUp { attempts: u32 },
}

/// Result of a transition attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionResult {
    /// The event was accepted
    Applied {
        from: ConnectionState,
        to: ConnectionState,
        directives: Vec<Directive>,
    },
    /// The event is valid here but has nothing to do
    Ignored {
        state: ConnectionState,
        event: SessionEvent,
    },
    /// The event does not belong to the current state (stale or out of order)
    Invalid {
        from: ConnectionState,
        event: SessionEvent,
    },
}

/// State machine for one logical subscription
#[derive(Debug, Clone)]
pub struct SessionStateMachine {
    current_state: ConnectionState,
    attempt: u32,
    policy: ReconnectPolicy,
}

impl Default for SessionStateMachine {
    fn default() -> Self {
        Self::new(ReconnectPolicy::default())
    }
}

impl SessionStateMachine {
    /// Create a new state machine in Idle state
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            current_state: ConnectionState::Idle,
            attempt: 0,
            policy,
        }
    }

    /// Get current state
    pub fn state(&self) -> ConnectionState {
        self.current_state
    }

    /// Consecutive failures since the last successful open
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    /// Process an event and return the transition result
    pub fn process_event(&mut self, event: SessionEvent) -> TransitionResult {
        use ConnectionState::*;
        use SessionEvent::*;

        let from = self.current_state;

        let (to, directives) = match (from, event) {
            // A fresh connect always starts a new session
            (Idle | Stopped, Connect) => {
                self.attempt = 0;
                (Connecting, vec![Directive::BeginSession, Directive::OpenChannel])
            }
            (Connecting | Open | Reconnecting | Closing, Connect) => {
                return TransitionResult::Ignored { state: from, event };
            }

            (Connecting, ChannelOpened) => {
                self.attempt = 0;
                (Open, vec![Directive::NotifyOpened])
            }

            (Connecting | Open, ChannelLost) => return self.after_failure(from),
            (Closing, ChannelLost) => {
                return TransitionResult::Ignored { state: from, event };
            }

            (Reconnecting, TimerFired) => (Connecting, vec![Directive::OpenChannel]),

            (Idle | Stopped, Disconnect) => (Stopped, vec![Directive::ClearObservers]),
            (Reconnecting, Disconnect) => (
                Stopped,
                vec![Directive::CancelReconnect, Directive::ClearObservers],
            ),
            (Connecting | Open, Disconnect) => (
                Closing,
                vec![
                    Directive::CancelReconnect,
                    Directive::ClearObservers,
                    Directive::CloseChannel,
                ],
            ),
            (Closing, Disconnect) => {
                return TransitionResult::Ignored { state: from, event };
            }

            (Closing, ChannelReleased) => (Stopped, Vec::new()),

            _ => return TransitionResult::Invalid { from, event },
        };

        debug_assert!(is_valid_transition(from, to));
        self.current_state = to;
        TransitionResult::Applied {
            from,
            to,
            directives,
        }
    }

    /// Count the failure and consult the reconnect policy
    fn after_failure(&mut self, from: ConnectionState) -> TransitionResult {
        self.attempt = self.attempt.saturating_add(1);

        let (to, directives) = match self.policy.decide(self.attempt) {
            ReconnectDecision::Retry(delay) => (
                ConnectionState::Reconnecting,
                vec![Directive::ScheduleReconnect {
                    attempt: self.attempt,
                    delay,
                }],
            ),
            ReconnectDecision::GiveUp => (
                ConnectionState::Stopped,
                vec![Directive::GiveUp {
                    attempts: self.attempt - 1,
                }],
            ),
        };

        self.current_state = to;
        TransitionResult::Applied {
            from,
            to,
            directives,
        }
    }
}

/// Check if a transition from one state to another is generally valid
pub fn is_valid_transition(from: ConnectionState, to: ConnectionState) -> bool {
    use ConnectionState::*;

    match (from, to) {
        // Disconnect can reach Stopped from anywhere
        (_, Stopped) => true,

        (Idle, Connecting) => true,
        (Connecting, Open) => true,
        (Connecting, Reconnecting) => true,
        (Connecting, Closing) => true,
        (Open, Reconnecting) => true,
        (Open, Closing) => true,
        (Reconnecting, Connecting) => true,
        (Stopped, Connecting) => true,

        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_machine() -> SessionStateMachine {
        let mut fsm = SessionStateMachine::default();
        fsm.process_event(SessionEvent::Connect);
        fsm.process_event(SessionEvent::ChannelOpened);
        fsm
    }

    #[test]
    fn test_initial_state() {
        let fsm = SessionStateMachine::default();
        assert_eq!(fsm.state(), ConnectionState::Idle);
        assert_eq!(fsm.attempts(), 0);
    }

    #[test]
    fn test_connect_and_open() {
        let mut fsm = SessionStateMachine::default();

        let result = fsm.process_event(SessionEvent::Connect);
        assert_eq!(
            result,
            TransitionResult::Applied {
                from: ConnectionState::Idle,
                to: ConnectionState::Connecting,
                directives: vec![Directive::BeginSession, Directive::OpenChannel],
            }
        );

        let result = fsm.process_event(SessionEvent::ChannelOpened);
        assert!(matches!(
            result,
            TransitionResult::Applied { to: ConnectionState::Open, ref directives, .. }
                if directives == &vec![Directive::NotifyOpened]
        ));
    }

    #[test]
    fn test_remote_close_schedules_reconnect() {
        let mut fsm = open_machine();

        let result = fsm.process_event(SessionEvent::ChannelLost);
        assert_eq!(
            result,
            TransitionResult::Applied {
                from: ConnectionState::Open,
                to: ConnectionState::Reconnecting,
                directives: vec![Directive::ScheduleReconnect {
                    attempt: 1,
                    delay: Duration::from_millis(3000),
                }],
            }
        );
        assert_eq!(fsm.attempts(), 1);

        let result = fsm.process_event(SessionEvent::TimerFired);
        assert!(matches!(
            result,
            TransitionResult::Applied { to: ConnectionState::Connecting, .. }
        ));
    }

    #[test]
    fn test_successful_open_resets_attempts() {
        let mut fsm = open_machine();
        fsm.process_event(SessionEvent::ChannelLost);
        fsm.process_event(SessionEvent::TimerFired);
        fsm.process_event(SessionEvent::ChannelLost);
        assert_eq!(fsm.attempts(), 2);

        fsm.process_event(SessionEvent::TimerFired);
        fsm.process_event(SessionEvent::ChannelOpened);
        assert_eq!(fsm.attempts(), 0);
        assert_eq!(fsm.state(), ConnectionState::Open);
    }

    #[test]
    fn test_gives_up_after_max_attempts() {
        let mut fsm = SessionStateMachine::default();
        fsm.process_event(SessionEvent::Connect);

        let mut delays = Vec::new();
        loop {
            match fsm.process_event(SessionEvent::ChannelLost) {
                TransitionResult::Applied { directives, .. } => match directives.as_slice() {
                    [Directive::ScheduleReconnect { delay, .. }] => {
                        delays.push(delay.as_millis() as u64);
                        fsm.process_event(SessionEvent::TimerFired);
                    }
                    [Directive::GiveUp { attempts }] => {
                        assert_eq!(*attempts, 5);
                        break;
                    }
                    other => panic!("unexpected directives: {:?}", other),
                },
                other => panic!("unexpected result: {:?}", other),
            }
        }

        assert_eq!(delays, vec![3000, 6000, 9000, 12000, 15000]);
        assert_eq!(fsm.state(), ConnectionState::Stopped);
    }

    #[test]
    fn test_connect_while_active_is_ignored() {
        let mut fsm = open_machine();
        let result = fsm.process_event(SessionEvent::Connect);
        assert!(matches!(result, TransitionResult::Ignored { .. }));
        assert_eq!(fsm.state(), ConnectionState::Open);
    }

    #[test]
    fn test_disconnect_from_open_closes_channel() {
        let mut fsm = open_machine();

        let result = fsm.process_event(SessionEvent::Disconnect);
        assert!(matches!(
            result,
            TransitionResult::Applied { to: ConnectionState::Closing, ref directives, .. }
                if directives.contains(&Directive::CloseChannel)
                    && directives.contains(&Directive::ClearObservers)
        ));

        let result = fsm.process_event(SessionEvent::ChannelReleased);
        assert!(matches!(
            result,
            TransitionResult::Applied { to: ConnectionState::Stopped, .. }
        ));
    }

    #[test]
    fn test_disconnect_while_reconnecting_cancels_timer() {
        let mut fsm = open_machine();
        fsm.process_event(SessionEvent::ChannelLost);

        let result = fsm.process_event(SessionEvent::Disconnect);
        assert_eq!(
            result,
            TransitionResult::Applied {
                from: ConnectionState::Reconnecting,
                to: ConnectionState::Stopped,
                directives: vec![Directive::CancelReconnect, Directive::ClearObservers],
            }
        );

        // A late timer must not restart anything
        let result = fsm.process_event(SessionEvent::TimerFired);
        assert!(matches!(result, TransitionResult::Invalid { .. }));
        assert_eq!(fsm.state(), ConnectionState::Stopped);
    }

    #[test]
    fn test_disconnect_is_idempotent() {
        let mut fsm = SessionStateMachine::default();
        fsm.process_event(SessionEvent::Disconnect);
        fsm.process_event(SessionEvent::Disconnect);
        assert_eq!(fsm.state(), ConnectionState::Stopped);
    }

    #[test]
    fn test_connect_after_stop_starts_fresh_session() {
        let mut fsm = open_machine();
        fsm.process_event(SessionEvent::ChannelLost);
        fsm.process_event(SessionEvent::Disconnect);

        let result = fsm.process_event(SessionEvent::Connect);
        assert!(matches!(
            result,
            TransitionResult::Applied { from: ConnectionState::Stopped, to: ConnectionState::Connecting, .. }
        ));
        assert_eq!(fsm.attempts(), 0);
    }

    #[test]
    fn test_stale_open_is_invalid() {
        let mut fsm = SessionStateMachine::default();
        let result = fsm.process_event(SessionEvent::ChannelOpened);
        assert!(matches!(result, TransitionResult::Invalid { .. }));
        assert_eq!(fsm.state(), ConnectionState::Idle);
    }

    #[test]
    fn test_transition_table() {
        use ConnectionState::*;

        assert!(is_valid_transition(Idle, Connecting));
        assert!(is_valid_transition(Open, Stopped));
        assert!(is_valid_transition(Reconnecting, Connecting));
        assert!(!is_valid_transition(Idle, Open));
        assert!(!is_valid_transition(Stopped, Reconnecting));
    }
}
