//! Control-channel state machine.
//!
//! The machine does no I/O. Both roles feed it every opcode of the session,
//! whether they sent it or received it, and carry out the [`Action`]s it
//! returns. An opcode that does not fit the current state is a protocol
//! error and leaves the machine where it was.
//!
//! ```text
//! AwaitCookie ──PARAM_EXCHANGE──▶ ParamExchange ──CREATE_STREAMS──▶ StreamsCreated
//!   ──TEST_START──▶ TestStarting ──TEST_RUNNING──▶ TestActive ──TEST_END──▶ TestEnded
//!   ──EXCHANGE_RESULTS──▶ ResultsExchanged ──DISPLAY_RESULTS──▶ DisplayingResults
//!   ──IPERF_DONE──▶ Done
//! ```

use crate::config::{Direction, Mode};
use crate::protocol::Opcode;
use crate::{Error, Result};
use log::debug;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Control connection up, cookie exchanged, nothing negotiated yet
    AwaitCookie,
    ParamExchange,
    StreamsCreated,
    TestStarting,
    TestActive,
    TestEnded,
    ResultsExchanged,
    DisplayingResults,
    Done,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Work the session driver must do after an opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    SendParams,
    ReceiveParams,
    OpenDataChannel,
    CloseDataChannel,
    StartStats,
    StopStats,
    /// Keep writing while the socket accepts data, so the receiver is not left waiting
    DrainSender,
    /// Collect what the sender put on the wire before it ended the test
    DrainReceiver,
    SendResults,
    ReceiveResults,
    DisplayResults,
    SendIperfDone,
    Finish,
}

/// Sequencing for one session, from one side.
///
/// # Examples
///
/// ```
/// use nperf3::config::{Direction, Mode};
/// use nperf3::protocol::Opcode;
/// use nperf3::state::{Action, State, StateMachine};
///
/// let mut machine = StateMachine::new(Mode::Client, Direction::Normal);
/// assert_eq!(machine.advance(Opcode::ParamExchange).unwrap(), vec![Action::SendParams]);
/// assert_eq!(machine.state(), State::ParamExchange);
///
/// // Results cannot be exchanged before the data channel exists
/// assert!(machine.advance(Opcode::ExchangeResults).is_err());
/// assert_eq!(machine.state(), State::ParamExchange);
/// ```
#[derive(Debug, Clone)]
pub struct StateMachine {
    role: Mode,
    direction: Direction,
    state: State,
    channels_opened: u32,
    channels_closed: u32,
}

impl StateMachine {
    /// A server learns the direction at `PARAM_EXCHANGE`; pass `Normal` and
    /// call [`StateMachine::set_direction`] once the parameters are in.
    pub fn new(role: Mode, direction: Direction) -> Self {
        Self {
            role,
            direction,
            state: State::AwaitCookie,
            channels_opened: 0,
            channels_closed: 0,
        }
    }

    pub fn set_direction(&mut self, direction: Direction) {
        self.direction = direction;
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn role(&self) -> Mode {
        self.role
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn is_done(&self) -> bool {
        self.state == State::Done
    }

    /// Data channels opened and closed so far.
    pub fn channel_counts(&self) -> (u32, u32) {
        (self.channels_opened, self.channels_closed)
    }

    /// Applies one opcode and returns the actions it calls for.
    ///
    /// # Errors
    ///
    /// `Error::Protocol` if the opcode is out of sequence, would open a second
    /// data channel, or is one of iperf3's abort codes.
    pub fn advance(&mut self, opcode: Opcode) -> Result<Vec<Action>> {
        if opcode.is_abort() {
            return Err(Error::protocol(format!(
                "peer aborted the test with {} in state {}",
                opcode, self.state
            )));
        }

        let next = match (self.state, opcode) {
            (State::AwaitCookie, Opcode::ParamExchange) => State::ParamExchange,
            (State::ParamExchange, Opcode::CreateStreams) => State::StreamsCreated,
            (State::StreamsCreated, Opcode::TestStart) => State::TestStarting,
            (State::TestStarting, Opcode::TestRunning) => State::TestActive,
            (State::TestActive, Opcode::TestEnd) => State::TestEnded,
            (State::TestEnded, Opcode::ExchangeResults) => State::ResultsExchanged,
            (State::ResultsExchanged, Opcode::DisplayResults) => State::DisplayingResults,
            (State::DisplayingResults, Opcode::IperfDone) => State::Done,
            (state, opcode) => {
                return Err(Error::protocol(format!(
                    "unexpected {} in state {}",
                    opcode, state
                )))
            }
        };

        if opcode == Opcode::CreateStreams && self.channels_opened > 0 {
            return Err(Error::protocol("a data channel is already open"));
        }

        let actions = self.actions_for(opcode);
        for action in &actions {
            match action {
                Action::OpenDataChannel => self.channels_opened += 1,
                Action::CloseDataChannel => self.channels_closed += 1,
                _ => {}
            }
        }

        debug!("{:?}: {} -> {} via {}", self.role, self.state, next, opcode);
        self.state = next;
        Ok(actions)
    }

    fn actions_for(&self, opcode: Opcode) -> Vec<Action> {
        use Action::*;

        let server = self.role == Mode::Server;
        let reverse = self.direction == Direction::Reverse;

        match opcode {
            Opcode::ParamExchange if server => vec![ReceiveParams],
            Opcode::ParamExchange => vec![SendParams],
            Opcode::CreateStreams => vec![OpenDataChannel],
            Opcode::TestStart if !server && reverse => vec![StartStats],
            Opcode::TestStart => vec![],
            Opcode::TestRunning if server || !reverse => vec![StartStats],
            Opcode::TestRunning => vec![],
            Opcode::TestEnd if server && reverse => vec![DrainSender, StopStats],
            Opcode::TestEnd if server => vec![DrainReceiver, StopStats],
            Opcode::TestEnd => vec![StopStats],
            Opcode::ExchangeResults if server => {
                vec![CloseDataChannel, ReceiveResults, SendResults]
            }
            Opcode::ExchangeResults => vec![CloseDataChannel, SendResults, ReceiveResults],
            Opcode::DisplayResults if server => vec![DisplayResults],
            Opcode::DisplayResults => vec![DisplayResults, SendIperfDone],
            Opcode::IperfDone => vec![Finish],
            _ => vec![],
        }
    }
}
