//! The interactive chat loop.
//!
//! Each turn stages the user's message, streams the assistant reply to the
//! terminal as it arrives and only then commits both messages to the
//! transcript. A failed or interrupted turn leaves the transcript as it was.

use std::io::Write;
use std::time::Instant;

use anyhow::Context;
use futures_util::StreamExt;
use log::{debug, info};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio_util::sync::CancellationToken;

use crate::error::ServiceError;
use crate::llm::InferenceService;
use crate::transcript::{Message, Transcript};

const EXIT_WORDS: [&str; 3] = ["quit", "exit", "bye"];

#[derive(Debug, PartialEq, Eq)]
pub enum Input<'a> {
    Empty,
    Exit,
    Prompt(&'a str),
}

pub fn classify_input(line: &str) -> Input<'_> {
    let line = line.trim();
    if line.is_empty() {
        Input::Empty
    } else if EXIT_WORDS.iter().any(|w| line.eq_ignore_ascii_case(w)) {
        Input::Exit
    } else {
        Input::Prompt(line)
    }
}

/// Why the loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    Quit,
    EndOfInput,
    Interrupted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnOutcome {
    Skipped,
    Exit,
    Replied,
    Failed,
    Interrupted,
}

pub struct Conversation<S> {
    service: S,
    transcript: Transcript,
    shutdown: CancellationToken,
    verbose: bool,
}

impl<S: InferenceService> Conversation<S> {
    pub fn new(service: S, transcript: Transcript, shutdown: CancellationToken) -> Self {
        Self { service, transcript, shutdown, verbose: false }
    }

    /// Print fragment throughput after each reply.
    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    /// Run turns until the operator quits, input ends, or shutdown is signalled.
    ///
    /// Only terminal I/O failures are returned as errors; service failures are
    /// reported inline and the loop keeps going.
    pub async fn run<R, W>(&mut self, input: R, output: &mut W) -> anyhow::Result<Exit>
    where
        R: AsyncBufRead + Unpin,
        W: Write,
    {
        writeln!(output, "Type 'quit', 'exit', or 'bye' to end the conversation.")?;
        let mut lines = input.lines();

        loop {
            write!(output, "\nYou: ")?;
            output.flush()?;

            let line = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return interrupted(output),
                line = lines.next_line() => line.context("failed to read input")?,
            };

            let Some(line) = line else {
                writeln!(output, "\nGoodbye!")?;
                return Ok(Exit::EndOfInput);
            };

            match self.turn(&line, output).await? {
                TurnOutcome::Exit => {
                    info!("user initiated exit after {} turn(s)", self.transcript.turns());
                    writeln!(output, "Goodbye! Thanks for chatting!")?;
                    return Ok(Exit::Quit);
                }
                TurnOutcome::Interrupted => return interrupted(output),
                TurnOutcome::Skipped | TurnOutcome::Replied | TurnOutcome::Failed => {}
            }
        }
    }

    /// Handle one line of operator input.
    pub async fn turn<W: Write>(
        &mut self,
        line: &str,
        output: &mut W,
    ) -> anyhow::Result<TurnOutcome> {
        let text = match classify_input(line) {
            Input::Empty => return Ok(TurnOutcome::Skipped),
            Input::Exit => return Ok(TurnOutcome::Exit),
            Input::Prompt(text) => text,
        };

        let user = Message::user(text);
        let request = self.transcript.with_pending(&user);
        info!("turn {}: user query of {} characters", self.transcript.turns() + 1, text.len());

        let started = Instant::now();
        let stream = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => return Ok(TurnOutcome::Interrupted),
            stream = self.service.stream_chat(&request) => stream,
        };
        let mut stream = match stream {
            Ok(stream) => stream,
            Err(err) => return report_failure(err, false, output),
        };

        let mut reply = String::new();
        let mut fragments = 0usize;
        loop {
            let next = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return Ok(TurnOutcome::Interrupted),
                next = stream.next() => next,
            };
            match next {
                Some(Ok(fragment)) => {
                    if fragments == 0 {
                        write!(output, "Assistant: ")?;
                    }
                    write!(output, "{fragment}")?;
                    output.flush()?;
                    reply.push_str(&fragment);
                    fragments += 1;
                }
                Some(Err(err)) => return report_failure(err, fragments > 0, output),
                None => break,
            }
        }
        if fragments > 0 {
            writeln!(output)?;
        }

        if self.verbose {
            let secs = started.elapsed().as_secs_f32();
            writeln!(
                output,
                "received {fragments} fragments in {secs:.2} s, speed {:.2} fragments/s",
                fragments as f32 / secs.max(f32::EPSILON)
            )?;
        }

        self.transcript.push_exchange(user, Message::assistant(reply));
        debug!("transcript holds {} messages", self.transcript.messages().len());
        Ok(TurnOutcome::Replied)
    }
}

fn report_failure<W: Write>(
    err: ServiceError,
    mid_reply: bool,
    output: &mut W,
) -> anyhow::Result<TurnOutcome> {
    // the operator already sees `err` on the output
    debug!("turn failed: {err:?}");
    if mid_reply {
        writeln!(output)?;
    }
    writeln!(output, "Error: {err}")?;
    Ok(TurnOutcome::Failed)
}

fn interrupted<W: Write>(output: &mut W) -> anyhow::Result<Exit> {
    info!("interrupted by user");
    writeln!(output, "\nInterrupted. Goodbye!")?;
    Ok(Exit::Interrupted)
}
