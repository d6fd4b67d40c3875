//! An interactive shell over a [`BuddyAllocator`] that stands in for a
//! server's memory.
//!
//! Sizes are read and printed in KB. Applications are identified by name.

use std::{
    io::{self, BufRead, Write},
    num::IntErrorKind,
};

use anyhow::{bail, Context};
use buddy_sim::{AllocError, BlockStatus, BuddyAllocator};
use tracing::{debug, info};

const CAPACITY_PROMPT: &str = "Enter the total memory size for the server (in KB): ";
const ACTION_PROMPT: &str = "Choose an action - 'allocate', 'release', 'display', or 'exit': ";
const NAME_PROMPT: &str = "Enter application name: ";
const RELEASE_PROMPT: &str = "Enter application name to release memory: ";

/// A command read at the action prompt.
///
/// Arguments may follow the action on the same line; absent ones are
/// prompted for.
#[derive(Clone, Debug, PartialEq, Eq)]
enum Action<'a> {
    Allocate {
        name: Option<&'a str>,
        size: Option<&'a str>,
    },
    Release {
        name: Option<&'a str>,
    },
    Display,
    Exit,
    Invalid,
}

impl<'a> Action<'a> {
    fn parse(line: &'a str) -> Action<'a> {
        let mut words = line.split_whitespace();
        let Some(verb) = words.next() else {
            return Action::Invalid;
        };

        let action = match verb.to_lowercase().as_str() {
            "allocate" => Action::Allocate {
                name: words.next(),
                size: words.next(),
            },
            "release" => Action::Release { name: words.next() },
            "display" => Action::Display,
            "exit" => Action::Exit,
            _ => return Action::Invalid,
        };

        if words.next().is_some() {
            return Action::Invalid;
        }

        action
    }
}

/// Why a memory size was refused.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum SizeError {
    NotInteger,
    NotPositive,
}

/// Parses a request size.
///
/// Returns `Ok(None)` for a positive integer too large to represent, which no
/// block can satisfy.
fn parse_size(text: &str) -> Result<Option<usize>, SizeError> {
    match text.parse::<usize>() {
        Ok(0) => Err(SizeError::NotPositive),
        Ok(size) => Ok(Some(size)),
        Err(e) if *e.kind() == IntErrorKind::PosOverflow => Ok(None),
        Err(_) => {
            let negative = text
                .strip_prefix('-')
                .is_some_and(|digits| !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()));

            if negative {
                Err(SizeError::NotPositive)
            } else {
                Err(SizeError::NotInteger)
            }
        }
    }
}

/// Parses a capacity, which must be a positive integer.
fn parse_capacity(text: &str) -> Option<usize> {
    text.parse::<usize>().ok().filter(|&cap| cap > 0)
}

/// Writes the block set of `buddy`, one line per block in offset order.
pub fn write_state<W: Write>(out: &mut W, buddy: &BuddyAllocator<String>) -> io::Result<()> {
    writeln!(out, "Current Memory State:")?;

    for block in buddy.snapshot() {
        match block.status {
            BlockStatus::Free => writeln!(out, " - Free Block: {} KB", block.size)?,
            BlockStatus::Allocated { owner } => {
                writeln!(out, " - Allocated to '{owner}' Block: {} KB", block.size)?
            }
        }
    }

    Ok(())
}

/// A prompt-driven session reading commands from `R` and writing to `W`.
#[derive(Debug)]
pub struct Shell<R, W> {
    input: R,
    output: W,
    line: String,
}

impl<R: BufRead, W: Write> Shell<R, W> {
    pub fn new(input: R, output: W) -> Shell<R, W> {
        Shell {
            input,
            output,
            line: String::new(),
        }
    }

    /// Consumes the shell, returning its output.
    pub fn into_output(self) -> W {
        self.output
    }

    /// Prints `prompt` and reads one trimmed line, or `None` at end of input.
    fn prompt(&mut self, prompt: &str) -> io::Result<Option<String>> {
        write!(self.output, "{prompt}")?;
        self.output.flush()?;

        self.line.clear();
        if self.input.read_line(&mut self.line)? == 0 {
            return Ok(None);
        }

        Ok(Some(self.line.trim().to_owned()))
    }

    /// Returns `arg` if present, otherwise prompts for the value.
    fn arg_or_prompt(&mut self, arg: Option<&str>, prompt: &str) -> io::Result<Option<String>> {
        match arg {
            Some(arg) => Ok(Some(arg.to_owned())),
            None => self.prompt(prompt),
        }
    }

    /// Prompts until a valid capacity is entered.
    pub fn read_capacity(&mut self) -> anyhow::Result<usize> {
        loop {
            let Some(text) = self.prompt(CAPACITY_PROMPT)? else {
                bail!("input ended before a memory size was entered");
            };

            match parse_capacity(&text) {
                Some(capacity) => return Ok(capacity),
                None => writeln!(
                    self.output,
                    "Please enter a valid positive integer for the memory size."
                )?,
            }
        }
    }

    /// Runs a session until `exit` or end of input.
    ///
    /// The capacity is prompted for when `capacity` is `None`.
    pub fn run(&mut self, capacity: Option<usize>) -> anyhow::Result<()> {
        let capacity = match capacity {
            Some(capacity) => capacity,
            None => self.read_capacity()?,
        };

        let mut buddy = BuddyAllocator::try_new(capacity)
            .with_context(|| format!("cannot manage {capacity} KB of memory"))?;
        info!(capacity, roots = buddy.snapshot().len(), "memory initialized");

        writeln!(self.output)?;
        writeln!(self.output, "Initial Memory State:")?;
        write_state(&mut self.output, &buddy)?;

        loop {
            writeln!(self.output)?;
            let Some(line) = self.prompt(ACTION_PROMPT)? else {
                break;
            };

            let more = match Action::parse(&line) {
                Action::Allocate { name, size } => self.allocate(&mut buddy, name, size)?,
                Action::Release { name } => self.release(&mut buddy, name)?,
                Action::Display => {
                    write_state(&mut self.output, &buddy)?;
                    true
                }
                Action::Exit => false,
                Action::Invalid => {
                    debug!(%line, "unrecognized action");
                    writeln!(self.output, "Invalid action. Please try again.")?;
                    true
                }
            };

            if !more {
                break;
            }
        }

        writeln!(self.output)?;
        writeln!(self.output, "Final Memory State:")?;
        write_state(&mut self.output, &buddy)?;

        Ok(())
    }

    /// Handles `allocate`. Returns `false` if input ended mid-command.
    fn allocate(
        &mut self,
        buddy: &mut BuddyAllocator<String>,
        name: Option<&str>,
        size: Option<&str>,
    ) -> io::Result<bool> {
        let Some(name) = self.arg_or_prompt(name, NAME_PROMPT)? else {
            return Ok(false);
        };

        let size_prompt = format!("Enter memory request size for '{name}' (in KB): ");
        let Some(text) = self.arg_or_prompt(size, &size_prompt)? else {
            return Ok(false);
        };

        let granted = match parse_size(&text) {
            Ok(Some(size)) => buddy.allocate(name.clone(), size),
            Ok(None) => Ok(false),
            Err(SizeError::NotInteger) => {
                writeln!(self.output, "Please enter a valid integer for the memory size.")?;
                return Ok(true);
            }
            Err(SizeError::NotPositive) => Err(AllocError::InvalidRequest),
        };

        match granted {
            Ok(true) => writeln!(self.output, "Allocated {text} KB to '{name}'.")?,
            Ok(false) => writeln!(
                self.output,
                "Failed to allocate {text} KB to '{name}'. Not enough space."
            )?,
            Err(AllocError::InvalidRequest) => {
                writeln!(self.output, "Memory size must be a positive integer.")?
            }
        }

        Ok(true)
    }

    /// Handles `release`. Returns `false` if input ended mid-command.
    fn release(&mut self, buddy: &mut BuddyAllocator<String>, name: Option<&str>) -> io::Result<bool> {
        let Some(name) = self.arg_or_prompt(name, RELEASE_PROMPT)? else {
            return Ok(false);
        };

        if buddy.release(&name) {
            writeln!(self.output, "Released memory from '{name}'.")?;
        } else {
            writeln!(self.output, "No memory found for application '{name}'.")?;
        }

        Ok(true)
    }
}
