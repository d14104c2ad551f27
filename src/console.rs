//! Operator console.
//!
//! Reads whitespace-delimited tokens and drives the [`LifecycleController`].
//! This loop is the only caller of controller operations, so they never run
//! concurrently.
//!
//! Commands:
//! - `stop` - stop the engine
//! - `chgd` - prompt for a delay in milliseconds and restart with it
//! - `chgn` - prompt for a node count and restart with it
//! - `start` - start the engine with the current configuration
//! - `status` - print state, configuration and bound devices
//!
//! Anything else is ignored.

use std::collections::VecDeque;
use std::io::{self, BufRead, Write};
use std::str::FromStr;
use std::time::Duration;

use tracing::{debug, warn};

use crate::bridge::DeviceBackend;
use crate::controller::{ControllerState, LifecycleController, StopOutcome};
use crate::error::{LanError, Result};

pub const PROMPT: &str = "> ";
pub const DELAY_PROMPT: &str = "delay > ";
pub const NODES_PROMPT: &str = "n nodes > ";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Stop,
    ChangeDelay,
    ChangeNodes,
    Start,
    Status,
    Unknown(String),
}

impl From<&str> for Command {
    fn from(token: &str) -> Self {
        match token {
            "stop" => Command::Stop,
            "chgd" => Command::ChangeDelay,
            "chgn" => Command::ChangeNodes,
            "start" => Command::Start,
            "status" => Command::Status,
            other => Command::Unknown(other.to_string()),
        }
    }
}

/// Parse a console argument, mapping anything non-numeric to `InvalidInput`.
pub fn parse_number<T: FromStr>(token: &str) -> Result<T> {
    token.parse::<T>().map_err(|_| LanError::InvalidInput {
        input: token.to_string(),
    })
}

/// Splits a line-oriented stream into whitespace-delimited tokens, so an
/// argument may follow its command on the same line or the next one.
struct TokenReader<R> {
    input: R,
    pending: VecDeque<String>,
}

impl<R: BufRead> TokenReader<R> {
    fn new(input: R) -> Self {
        Self {
            input,
            pending: VecDeque::new(),
        }
    }

    /// Next token, or `None` at end of input. Invalid UTF-8 is replaced
    /// rather than rejected, so stray bytes end up as unknown tokens.
    fn next_token(&mut self) -> io::Result<Option<String>> {
        let mut line = Vec::new();
        loop {
            if let Some(token) = self.pending.pop_front() {
                return Ok(Some(token));
            }
            line.clear();
            if self.input.read_until(b'\n', &mut line)? == 0 {
                return Ok(None);
            }
            self.pending.extend(
                String::from_utf8_lossy(&line)
                    .split_whitespace()
                    .map(str::to_owned),
            );
        }
    }
}

pub struct ConsoleCommandLoop<R, W> {
    tokens: TokenReader<R>,
    out: W,
}

impl<R: BufRead, W: Write> ConsoleCommandLoop<R, W> {
    pub fn new(input: R, out: W) -> Self {
        Self {
            tokens: TokenReader::new(input),
            out,
        }
    }

    /// Serve commands until the input ends.
    pub fn run<B: DeviceBackend>(&mut self, controller: &mut LifecycleController<B>) -> io::Result<()> {
        loop {
            self.prompt(PROMPT)?;
            let Some(token) = self.tokens.next_token()? else {
                return Ok(());
            };
            if !self.dispatch(Command::from(token.as_str()), controller)? {
                return Ok(());
            }
        }
    }

    pub fn into_output(self) -> W {
        self.out
    }

    /// Execute one command. Returns `false` if input ended mid-command.
    fn dispatch<B: DeviceBackend>(
        &mut self,
        command: Command,
        controller: &mut LifecycleController<B>,
    ) -> io::Result<bool> {
        match command {
            Command::Stop => {
                writeln!(self.out, "stopping")?;
                let result = controller.stop();
                self.report_stop(result)?;
            }
            Command::ChangeDelay => {
                let Some(arg) = self.read_argument(DELAY_PROMPT)? else {
                    return Ok(false);
                };
                let config = controller.config();
                let result = parse_number::<u64>(&arg).and_then(|ms| {
                    controller.restart(Duration::from_millis(ms), config.node_count)
                });
                self.report(result)?;
            }
            Command::ChangeNodes => {
                let Some(arg) = self.read_argument(NODES_PROMPT)? else {
                    return Ok(false);
                };
                let config = controller.config();
                let result = parse_number::<u32>(&arg)
                    .and_then(|nodes| controller.restart(config.delay, nodes));
                self.report(result)?;
            }
            Command::Start => {
                if controller.is_running() {
                    debug!("start ignored, engine already running");
                } else {
                    let config = controller.config();
                    let result = controller.start(config.delay, config.node_count);
                    self.report(result)?;
                }
            }
            Command::Status => {
                let state = match controller.state() {
                    ControllerState::Running => "running",
                    ControllerState::Stopped => "stopped",
                };
                writeln!(
                    self.out,
                    "{state} {} devices=[{}]",
                    controller.config(),
                    controller.active_bindings().join(", ")
                )?;
            }
            Command::Unknown(token) => {
                debug!(%token, "ignored console input");
            }
        }
        Ok(true)
    }

    fn prompt(&mut self, text: &str) -> io::Result<()> {
        write!(self.out, "{text}")?;
        self.out.flush()
    }

    fn read_argument(&mut self, prompt: &str) -> io::Result<Option<String>> {
        self.prompt(prompt)?;
        self.tokens.next_token()
    }

    fn report(&mut self, result: Result<()>) -> io::Result<()> {
        if let Err(err) = result {
            warn!("{err}");
            writeln!(self.out, "error: {err}")?;
        }
        Ok(())
    }

    fn report_stop(&mut self, result: Result<StopOutcome>) -> io::Result<()> {
        match result {
            Ok(StopOutcome::Forced(report)) => writeln!(
                self.out,
                "warning: engine needed a forced stop, {} frames discarded",
                report.discarded
            ),
            Ok(_) => Ok(()),
            Err(err) => {
                warn!("{err}");
                writeln!(self.out, "error: {err}")
            }
        }
    }
}
