//! Message reassembly
//!
//! Turns a stream of frames into whole messages, joining fragmented text and
//! binary messages and passing control frames straight through (they may
//! arrive between fragments).

use super::error::FrameError;
use super::frame::{parse_close_payload, Frame, OpCode};

/// A complete application or control message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Text(String),
    Binary(Vec<u8>),
    /// Status code and reason, if the peer sent one
    Close(Option<(u16, String)>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
}

/// Per-connection fragment accumulator
#[derive(Debug)]
pub struct MessageAssembler {
    partial: Option<(OpCode, Vec<u8>)>,
    max_message_size: usize,
}

impl MessageAssembler {
    pub fn new(max_message_size: usize) -> Self {
        Self {
            partial: None,
            max_message_size,
        }
    }

    /// Whether a fragmented message is in progress
    pub fn in_progress(&self) -> bool {
        self.partial.is_some()
    }

    /// Feed one frame; returns a message once one is complete
    pub fn push(&mut self, frame: Frame) -> Result<Option<Message>, FrameError> {
        match frame.opcode {
            OpCode::Close => Ok(Some(Message::Close(parse_close_payload(&frame.payload)))),
            OpCode::Ping => Ok(Some(Message::Ping(frame.payload))),
            OpCode::Pong => Ok(Some(Message::Pong(frame.payload))),
            OpCode::Continuation => {
                let (opcode, mut data) = self
                    .partial
                    .take()
                    .ok_or(FrameError::UnexpectedContinuation)?;
                data.extend_from_slice(&frame.payload);
                self.check_size(data.len())?;

                if frame.fin {
                    finish(opcode, data).map(Some)
                } else {
                    self.partial = Some((opcode, data));
                    Ok(None)
                }
            }
            OpCode::Text | OpCode::Binary => {
                if self.partial.is_some() {
                    return Err(FrameError::InterleavedMessage);
                }
                self.check_size(frame.payload.len())?;

                if frame.fin {
                    finish(frame.opcode, frame.payload).map(Some)
                } else {
                    self.partial = Some((frame.opcode, frame.payload));
                    Ok(None)
                }
            }
        }
    }

    fn check_size(&self, len: usize) -> Result<(), FrameError> {
        if len > self.max_message_size {
            return Err(FrameError::PayloadTooLarge {
                len: len as u64,
                limit: self.max_message_size as u64,
            });
        }
        Ok(())
    }
}

fn finish(opcode: OpCode, data: Vec<u8>) -> Result<Message, FrameError> {
    match opcode {
        OpCode::Text => String::from_utf8(data)
            .map(Message::Text)
            .map_err(|_| FrameError::InvalidUtf8),
        _ => Ok(Message::Binary(data)),
    }
}
