//! Framing of the raw client byte stream.
//!
//! The `Framer` turns bytes received from a client into command lines and,
//! after `enter_data_mode`, into message body chunks with the SMTP
//! dot-stuffing removed.

use std::mem;

/// A unit of input produced by the `Framer`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A command line without its line ending
    Command(Vec<u8>),
    /// A chunk of message body, dot-stuffing removed, line endings kept
    Data(Vec<u8>),
    /// The end of the message body was seen
    DataEnd,
}

#[derive(Debug)]
enum Mode {
    Command,
    Data { line_start: bool },
    DataEnded,
}

// What a line in the body starts with
enum LineStart {
    NeedMore,
    Terminator(usize),
    Stuffed,
    Plain,
}

/// Splits a byte stream into SMTP commands and message bodies.
///
/// After a `Frame::Command` or `Frame::DataEnd` has been returned, no further
/// command is produced until `resume` is called.
#[derive(Debug)]
pub struct Framer {
    buf: Vec<u8>,
    mode: Mode,
    waiting: bool,
}

impl Default for Framer {
    fn default() -> Self {
        Self::new()
    }
}

impl Framer {
    /// Create a framer in command mode
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(1024),
            mode: Mode::Command,
            waiting: false,
        }
    }

    /// Append bytes received from the client
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Signal that the last command or message body has been handled
    pub fn resume(&mut self) {
        self.waiting = false;
    }

    /// Is the framer waiting for `resume`?
    pub fn is_waiting(&self) -> bool {
        self.waiting && matches!(self.mode, Mode::Command)
    }

    /// Switch to message body capture.
    ///
    /// Body chunks are returned by `next_frame` until the terminating
    /// `.` line, which produces `Frame::DataEnd`.
    pub fn enter_data_mode(&mut self) {
        self.mode = Mode::Data { line_start: true };
    }

    /// Is a message body being captured?
    pub fn in_data_mode(&self) -> bool {
        !matches!(self.mode, Mode::Command)
    }

    /// Drop any buffered input
    pub fn discard(&mut self) {
        self.buf.clear();
    }

    /// Remove and return the buffered input without framing it
    pub fn take_buffered(&mut self) -> Vec<u8> {
        mem::take(&mut self.buf)
    }

    /// Return the next frame that can be built from the buffered input
    pub fn next_frame(&mut self) -> Option<Frame> {
        match self.mode {
            Mode::Command => self.next_command(),
            Mode::Data { line_start } => self.next_data(line_start),
            Mode::DataEnded => {
                self.mode = Mode::Command;
                self.waiting = true;
                Some(Frame::DataEnd)
            }
        }
    }

    /// Signal the end of input.
    ///
    /// A final command that was not terminated by a line ending is returned.
    pub fn finish(&mut self) -> Option<Frame> {
        if let Some(frame) = self.next_frame() {
            return Some(frame);
        }
        match self.mode {
            Mode::Command if !self.waiting && !self.buf.is_empty() => {
                let mut line = mem::take(&mut self.buf);
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                self.waiting = true;
                Some(Frame::Command(line))
            }
            _ => None,
        }
    }

    fn next_command(&mut self) -> Option<Frame> {
        if self.waiting {
            return None;
        }
        let end = self.buf.iter().position(|b| *b == b'\n')?;
        let mut line: Vec<u8> = self.buf.drain(..=end).collect();
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        self.waiting = true;
        Some(Frame::Command(line))
    }

    fn next_data(&mut self, mut line_start: bool) -> Option<Frame> {
        let mut chunk = Vec::with_capacity(self.buf.len());
        let mut pos = 0;
        let mut ended = false;
        while pos < self.buf.len() {
            if line_start {
                match line_start_kind(&self.buf[pos..]) {
                    LineStart::NeedMore => break,
                    LineStart::Terminator(len) => {
                        pos += len;
                        ended = true;
                        break;
                    }
                    LineStart::Stuffed => pos += 1,
                    LineStart::Plain => (),
                }
                line_start = false;
            }
            match self.buf[pos..].iter().position(|b| *b == b'\n') {
                Some(offset) => {
                    chunk.extend_from_slice(&self.buf[pos..=pos + offset]);
                    pos += offset + 1;
                    line_start = true;
                }
                None => {
                    chunk.extend_from_slice(&self.buf[pos..]);
                    pos = self.buf.len();
                }
            }
        }
        self.buf.drain(..pos);
        self.mode = if ended {
            Mode::DataEnded
        } else {
            Mode::Data { line_start }
        };
        if chunk.is_empty() {
            if ended {
                self.next_frame()
            } else {
                None
            }
        } else {
            Some(Frame::Data(chunk))
        }
    }
}

// Classify the start of a body line
fn line_start_kind(buf: &[u8]) -> LineStart {
    match buf {
        [] | [b'.'] | [b'.', b'\r'] => LineStart::NeedMore,
        [b'.', b'\n', ..] => LineStart::Terminator(2),
        [b'.', b'\r', b'\n', ..] => LineStart::Terminator(3),
        [b'.', b'.', ..] => LineStart::Stuffed,
        _ => LineStart::Plain,
    }
}

//------ Tests -----------------------------------------------------------------
