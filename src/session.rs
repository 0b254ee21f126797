//! One test session over an established control connection.
//!
//! The driver owns every socket of the session, so all of them close when
//! the session returns, on the error path too. Each iteration of the wait
//! loop selects over three sources, control first:
//!
//! 1. one opcode byte on the control connection
//! 2. readiness of the data channel in this side's direction
//! 3. a timer bounded by [`Stats::max_wait`] (and the client's test deadline)
//!
//! and calls [`Stats::update`] afterwards so interval lines are never late by
//! more than one iteration.

use crate::config::{Config, Direction, Mode, Protocol};
use crate::cookie::Cookie;
use crate::net::NetStack;
use crate::protocol::{
    read_frame, read_opcode, write_frame, write_opcode, Opcode, Parameters, Results,
    StreamResult, WireParameters,
};
use crate::reporter::SinkRef;
use crate::state::{Action, State, StateMachine};
use crate::stats::Stats;
use crate::transport::{self, DataChannel, DataPump, Flow, PumpOutcome};
use crate::{Error, Result};
use log::{debug, info, warn};
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::time::{self, Instant};

/// Shortest timer the loop arms, so an overdue report cannot spin it.
const MIN_WAIT: Duration = Duration::from_millis(1);

/// What a finished session measured.
#[derive(Debug, Clone, PartialEq)]
pub struct TestOutcome {
    pub params: Parameters,
    /// This side's result record
    pub local: StreamResult,
    /// The peer's result record, as received
    pub remote: StreamResult,
}

impl TestOutcome {
    /// Bytes the sending side put on the wire.
    pub fn sent_bytes(&self, role: Mode) -> u64 {
        match Flow::for_role(role, self.params.direction) {
            Flow::Send => self.local.bytes,
            Flow::Receive => self.remote.bytes,
        }
    }

    /// Bytes the receiving side counted.
    pub fn received_bytes(&self, role: Mode) -> u64 {
        match Flow::for_role(role, self.params.direction) {
            Flow::Send => self.remote.bytes,
            Flow::Receive => self.local.bytes,
        }
    }
}

/// Per-test state, created once parameters are known.
struct Test {
    params: Parameters,
    stats: Stats,
    pump: DataPump,
    retransmits_known: bool,
}

/// How this side opens the data channel.
enum Endpoint<'a> {
    Server {
        listener: &'a TcpListener,
        /// UDP socket bound before `CREATE_STREAMS` goes out
        udp: Option<UdpSocket>,
    },
    Client {
        server: SocketAddr,
    },
}

struct Session<'a, N: NetStack> {
    config: &'a Config,
    net: &'a N,
    sink: SinkRef,
    machine: StateMachine,
    control: TcpStream,
    cookie: Cookie,
    endpoint: Endpoint<'a>,
    test: Option<Test>,
    data: Option<DataChannel>,
    data_eof: bool,
    deadline: Option<Instant>,
    remote: Option<StreamResult>,
}

/// Runs the server side of one session.
///
/// The client's cookie is read first; the server then drives the test by
/// sending opcodes, and only listens for `TEST_END` and `IPERF_DONE`.
pub async fn serve<N: NetStack>(
    config: &Config,
    net: &N,
    sink: SinkRef,
    listener: &TcpListener,
    mut control: TcpStream,
) -> Result<TestOutcome> {
    let cookie = time::timeout(config.stream_timeout, Cookie::read_from(&mut control))
        .await
        .map_err(|_| Error::Connection("client did not send a cookie".to_string()))??;
    debug!("Session cookie {}", cookie);

    let mut session = Session {
        config,
        net,
        sink,
        machine: StateMachine::new(Mode::Server, Direction::Normal),
        control,
        cookie,
        endpoint: Endpoint::Server { listener, udp: None },
        test: None,
        data: None,
        data_eof: false,
        deadline: None,
        remote: None,
    };

    session.send(Opcode::ParamExchange).await?;

    if session.params()?.protocol == Protocol::Udp {
        let local = listener.local_addr()?;
        let socket = net.bind_udp(local).await?;
        if let Endpoint::Server { udp, .. } = &mut session.endpoint {
            *udp = Some(socket);
        }
    }

    session.send(Opcode::CreateStreams).await?;
    session.send(Opcode::TestStart).await?;
    session.send(Opcode::TestRunning).await?;

    session.run_until(State::TestEnded).await?;

    session.send(Opcode::ExchangeResults).await?;
    session.send(Opcode::DisplayResults).await?;

    let opcode = read_opcode(&mut session.control).await?;
    session.dispatch(opcode).await?;

    session.outcome()
}

/// Runs the client side of one session on a fresh control connection.
///
/// The client answers the server's opcodes and owns the test clock: once the
/// duration has passed, the byte budget is spent, or the data channel
/// closes, it sends `TEST_END`.
pub async fn run<N: NetStack>(
    config: &Config,
    net: &N,
    sink: SinkRef,
    mut control: TcpStream,
    server: SocketAddr,
) -> Result<TestOutcome> {
    let params = config.to_params()?;
    let cookie = Cookie::generate();
    cookie.write_to(&mut control).await?;
    debug!("Session cookie {}", cookie);

    let flow = Flow::for_role(Mode::Client, params.direction);
    let test = Test {
        stats: Stats::for_params(&params, flow, sink.clone()),
        pump: DataPump::new(&params, flow, config.would_block),
        params,
        retransmits_known: false,
    };

    let mut session = Session {
        config,
        net,
        sink,
        machine: StateMachine::new(Mode::Client, config.direction()),
        control,
        cookie,
        endpoint: Endpoint::Client { server },
        test: Some(test),
        data: None,
        data_eof: false,
        deadline: None,
        remote: None,
    };

    session.run_until(State::Done).await?;
    session.outcome()
}

impl<'a, N: NetStack> Session<'a, N> {
    fn role(&self) -> Mode {
        self.machine.role()
    }

    fn params(&self) -> Result<&Parameters> {
        self.test
            .as_ref()
            .map(|test| &test.params)
            .ok_or_else(|| Error::protocol("parameters have not been exchanged"))
    }

    fn test_mut(&mut self) -> Result<&mut Test> {
        self.test
            .as_mut()
            .ok_or_else(|| Error::protocol("parameters have not been exchanged"))
    }

    /// Sends an opcode, then carries out what it implies for this side.
    async fn send(&mut self, opcode: Opcode) -> Result<()> {
        let actions = self.machine.advance(opcode)?;
        write_opcode(&mut self.control, opcode).await?;
        debug!("Sent {}", opcode);
        self.execute(actions).await
    }

    /// Handles an opcode received from the peer.
    async fn dispatch(&mut self, opcode: Opcode) -> Result<()> {
        debug!("Received {}", opcode);
        let actions = self.machine.advance(opcode)?;
        self.execute(actions).await
    }

    async fn execute(&mut self, actions: Vec<Action>) -> Result<()> {
        let mut queue: VecDeque<Action> = actions.into();

        while let Some(action) = queue.pop_front() {
            match action {
                Action::SendParams => {
                    let wire = self.params()?.to_wire();
                    write_frame(&mut self.control, &wire).await?;
                }
                Action::ReceiveParams => self.receive_params().await?,
                Action::OpenDataChannel => self.open_data_channel().await?,
                Action::CloseDataChannel => {
                    if self.data.take().is_some() {
                        debug!("Data channel closed");
                    }
                }
                Action::StartStats => self.start_stats()?,
                Action::StopStats => self.stop_stats()?,
                Action::DrainSender => {
                    let data = self.data.as_ref().ok_or_else(|| Error::protocol("data channel is not open"))?;
                    let test = self.test.as_mut().ok_or_else(|| Error::protocol("parameters have not been exchanged"))?;
                    test.pump.drain_sender(data)?;
                }
                Action::DrainReceiver => {
                    if !self.data_eof {
                        let limit = self.config.stream_timeout;
                        let data = self.data.as_ref().ok_or_else(|| Error::protocol("data channel is not open"))?;
                        let test = self.test.as_mut().ok_or_else(|| Error::protocol("parameters have not been exchanged"))?;
                        let drained = test.pump.drain_receiver(data, &mut test.stats, limit).await?;
                        debug!("Collected {} bytes after TEST_END", drained);
                    }
                }
                Action::SendResults => {
                    let test = self.test_mut()?;
                    let results = Results::single(test.stats.result(), test.retransmits_known);
                    write_frame(&mut self.control, &results).await?;
                }
                Action::ReceiveResults => {
                    let results: Results = read_frame(&mut self.control).await?;
                    self.remote = Some(results.stream()?.clone());
                }
                Action::DisplayResults => {
                    let remote = self
                        .remote
                        .as_ref()
                        .ok_or_else(|| Error::protocol("no results received from peer"))?;
                    let test = self.test.as_ref().ok_or_else(|| Error::protocol("parameters have not been exchanged"))?;
                    test.stats.report_peer(remote);
                }
                Action::SendIperfDone => {
                    let more = self.machine.advance(Opcode::IperfDone)?;
                    write_opcode(&mut self.control, Opcode::IperfDone).await?;
                    queue.extend(more);
                }
                Action::Finish => {
                    info!("Test complete");
                }
            }
        }
        Ok(())
    }

    async fn receive_params(&mut self) -> Result<()> {
        let wire: WireParameters = read_frame(&mut self.control).await.map_err(|e| match e {
            Error::Json(e) => Error::Protocol(format!("invalid parameters: {}", e)),
            other => other,
        })?;
        let params = Parameters::try_from(wire)?;
        info!(
            "Test parameters: {:?} {:?}, {} byte buffers, {:?}, client version {:?}",
            params.protocol, params.direction, params.len, params.duration, params.client_version
        );

        self.machine.set_direction(params.direction);
        let flow = Flow::for_role(Mode::Server, params.direction);
        self.test = Some(Test {
            stats: Stats::for_params(&params, flow, self.sink.clone()),
            pump: DataPump::new(&params, flow, self.config.would_block),
            params,
            retransmits_known: false,
        });
        Ok(())
    }

    async fn open_data_channel(&mut self) -> Result<()> {
        let protocol = self.params()?.protocol;
        let timeout = self.config.stream_timeout;

        let channel = match (&mut self.endpoint, protocol) {
            (Endpoint::Server { listener, .. }, Protocol::Tcp) => {
                DataChannel::Tcp(transport::accept_tcp(listener, &self.cookie, timeout).await?)
            }
            (Endpoint::Server { udp, .. }, Protocol::Udp) => {
                let socket = udp
                    .take()
                    .ok_or_else(|| Error::protocol("UDP socket was not prepared"))?;
                DataChannel::Udp(transport::accept_udp(socket, timeout).await?)
            }
            (Endpoint::Client { server }, Protocol::Tcp) => DataChannel::Tcp(
                transport::connect_tcp(self.net, *server, &self.cookie, timeout).await?,
            ),
            (Endpoint::Client { server }, Protocol::Udp) => DataChannel::Udp(
                transport::connect_udp(
                    self.net,
                    *server,
                    self.config.strict_udp_ack,
                    self.config.udp_ack_timeout,
                )
                .await?,
            ),
        };

        self.data = Some(channel);
        Ok(())
    }

    fn start_stats(&mut self) -> Result<()> {
        let is_client = self.role() == Mode::Client;
        let test = self.test_mut()?;
        test.stats.start();
        let duration = test.params.duration;
        // A byte budget replaces the clock, as with iperf3 -n
        if is_client && !duration.is_zero() && test.params.bytes.is_none() {
            self.deadline = Some(Instant::now() + duration);
        }
        Ok(())
    }

    fn stop_stats(&mut self) -> Result<()> {
        let retransmits = self.data.as_ref().and_then(DataChannel::tcp_retransmits);
        let test = self.test_mut()?;
        if test.pump.flow() == Flow::Send {
            if let Some(retransmits) = retransmits {
                test.stats.set_retransmits(retransmits);
                test.retransmits_known = true;
            }
        }
        test.stats.stop();
        Ok(())
    }

    /// Whether the data branch takes part in the wait.
    fn data_active(&self) -> bool {
        self.data.is_some()
            && !self.data_eof
            && self.test.as_ref().is_some_and(|test| {
                test.stats.is_running() && !test.pump.is_exhausted()
            })
    }

    fn wait_budget(&self) -> Option<Duration> {
        let stats_wait = self.test.as_ref().and_then(|test| test.stats.max_wait());
        let deadline_wait = self
            .deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()));
        let wait = match (stats_wait, deadline_wait) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        wait.map(|wait| wait.max(MIN_WAIT))
    }

    /// Runs the wait/dispatch loop until the machine reaches `target`.
    async fn run_until(&mut self, target: State) -> Result<()> {
        while self.machine.state() != target {
            let active = self.data_active();
            let mut pace = Duration::ZERO;
            let mut flow = Flow::Receive;
            if let Some(test) = self.test.as_mut() {
                flow = test.pump.flow();
                if active {
                    pace = test.pump.pacing_delay();
                }
            }
            let wait = self.wait_budget();
            let data = if active { self.data.as_ref() } else { None };

            tokio::select! {
                biased;

                byte = self.control.read_u8() => {
                    let opcode = match byte {
                        Ok(byte) => Opcode::try_from(byte)?,
                        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                            return Err(Error::Connection(format!(
                                "control connection closed by peer in state {}",
                                self.machine.state()
                            )));
                        }
                        Err(e) => return Err(e.into()),
                    };
                    self.dispatch(opcode).await?;
                }
                ready = data_ready(data, flow, pace) => {
                    ready?;
                    self.pump_once().await?;
                }
                _ = sleep_or_pending(wait) => {}
            }

            if let Some(test) = self.test.as_mut() {
                test.stats.update(false);
            }

            if self.role() == Mode::Client && self.test_should_end() {
                self.end_test().await?;
            }
        }
        Ok(())
    }

    async fn pump_once(&mut self) -> Result<()> {
        let data = self.data.as_ref().ok_or_else(|| Error::protocol("data channel is not open"))?;
        let test = self.test.as_mut().ok_or_else(|| Error::protocol("parameters have not been exchanged"))?;
        if test.pump.pump(data, &mut test.stats).await? == PumpOutcome::Closed {
            info!("Data channel closed by peer");
            self.data_eof = true;
        }
        Ok(())
    }

    fn test_should_end(&self) -> bool {
        if self.machine.state() != State::TestActive {
            return false;
        }
        let Some(test) = self.test.as_ref() else {
            return false;
        };
        let expired = self.deadline.is_some_and(|deadline| Instant::now() >= deadline);
        // A reverse test with a byte budget ends once the budget has arrived
        let received = test.pump.flow() == Flow::Receive
            && test.params.bytes.is_some_and(|bytes| test.stats.total_bytes() >= bytes);
        expired || self.data_eof || test.pump.is_exhausted() || received
    }

    /// Client: stop sending, tell the server, and stop measuring.
    async fn end_test(&mut self) -> Result<()> {
        let sending = self.test.as_ref().is_some_and(|test| test.pump.flow() == Flow::Send);
        if sending && !self.data_eof {
            if let Some(data) = self.data.as_mut() {
                if let Err(e) = data.shutdown_write().await {
                    warn!("Failed to shut down data channel: {}", e);
                }
            }
        }
        self.send(Opcode::TestEnd).await
    }

    fn outcome(self) -> Result<TestOutcome> {
        let test = self
            .test
            .ok_or_else(|| Error::protocol("parameters have not been exchanged"))?;
        let remote = self
            .remote
            .ok_or_else(|| Error::protocol("no results received from peer"))?;
        Ok(TestOutcome {
            local: test.stats.result(),
            params: test.params,
            remote,
        })
    }
}

async fn data_ready(channel: Option<&DataChannel>, flow: Flow, pace: Duration) -> io::Result<()> {
    match channel {
        Some(channel) => {
            if !pace.is_zero() {
                time::sleep(pace).await;
            }
            channel.ready(flow).await
        }
        None => std::future::pending().await,
    }
}

async fn sleep_or_pending(wait: Option<Duration>) {
    match wait {
        Some(wait) => time::sleep(wait).await,
        None => std::future::pending().await,
    }
}
