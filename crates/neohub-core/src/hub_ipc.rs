use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use std::mem;
use thiserror::Error;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;
pub const HEADER_BYTES: usize = 4;
/// Sent back unframed once a request has been accepted.
pub const ACK: &[u8] = b"OK";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame exceeds max size: {size} > {max}")]
    OversizedFrame { size: usize, max: usize },
    #[error("frame encode failed: {0}")]
    Encode(String),
    #[error("frame decode failed: {0}")]
    Decode(String),
}

#[derive(Debug, Clone)]
pub struct DecodeReport<T> {
    pub frames: Vec<T>,
    pub errors: Vec<FrameError>,
}

impl<T> Default for DecodeReport<T> {
    fn default() -> Self {
        Self {
            frames: Vec::new(),
            errors: Vec::new(),
        }
    }
}

impl<T> DecodeReport<T> {
    fn push_frame(&mut self, frame: T) {
        self.frames.push(frame);
    }

    fn push_error(&mut self, error: FrameError) {
        self.errors.push(error);
    }
}

/// `[u32 big-endian length][json body]`
pub fn encode_frame<T: Serialize>(
    value: &T,
    max_frame_bytes: usize,
) -> Result<Vec<u8>, FrameError> {
    let body = serde_json::to_vec(value).map_err(|err| FrameError::Encode(err.to_string()))?;
    let max = max_frame_bytes.min(u32::MAX as usize);
    if body.len() > max {
        return Err(FrameError::OversizedFrame {
            size: body.len(),
            max,
        });
    }
    let mut frame = Vec::with_capacity(HEADER_BYTES + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

pub fn decode_body<T: DeserializeOwned>(body: &[u8]) -> Result<T, FrameError> {
    serde_json::from_slice(body).map_err(|err| FrameError::Decode(err.to_string()))
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum MessageHandlerState {
    #[default]
    Ready,
    Reading {
        length: u32,
        buffer: Vec<u8>,
    },
}

/// Per-connection reassembly of length-prefixed frames.
///
/// While `Reading`, the buffer is always shorter than the declared length; the
/// chunk that completes a frame moves the state back to `Ready` and any bytes
/// past the frame start the next header. A header split across chunks is
/// carried in `header` until all four bytes have arrived.
#[derive(Debug)]
pub struct FrameAssembler {
    max_frame_bytes: usize,
    state: MessageHandlerState,
    header: Vec<u8>,
}

impl FrameAssembler {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            max_frame_bytes,
            state: MessageHandlerState::Ready,
            header: Vec::with_capacity(HEADER_BYTES),
        }
    }

    pub fn state(&self) -> &MessageHandlerState {
        &self.state
    }

    pub fn push_chunk(&mut self, chunk: &[u8]) -> DecodeReport<Vec<u8>> {
        let mut report = DecodeReport::default();
        let mut rest = chunk;

        while !rest.is_empty() {
            match &mut self.state {
                MessageHandlerState::Ready => {
                    let take = (HEADER_BYTES - self.header.len()).min(rest.len());
                    self.header.extend_from_slice(&rest[..take]);
                    rest = &rest[take..];
                    if self.header.len() < HEADER_BYTES {
                        break;
                    }

                    let length = u32::from_be_bytes([
                        self.header[0],
                        self.header[1],
                        self.header[2],
                        self.header[3],
                    ]);
                    self.header.clear();

                    if length as usize > self.max_frame_bytes {
                        report.push_error(FrameError::OversizedFrame {
                            size: length as usize,
                            max: self.max_frame_bytes,
                        });
                        // The stream can't be resynchronized past an unread body.
                        break;
                    }
                    if length == 0 {
                        report.push_frame(Vec::new());
                        continue;
                    }

                    self.state = MessageHandlerState::Reading {
                        length,
                        buffer: Vec::with_capacity((length as usize).min(64 * 1024)),
                    };
                }
                MessageHandlerState::Reading { length, buffer } => {
                    let missing = *length as usize - buffer.len();
                    let take = missing.min(rest.len());
                    buffer.extend_from_slice(&rest[..take]);
                    rest = &rest[take..];

                    if take == missing {
                        if let MessageHandlerState::Reading { buffer, .. } =
                            mem::take(&mut self.state)
                        {
                            report.push_frame(buffer);
                        }
                    }
                }
            }
        }

        report
    }
}

impl Default for FrameAssembler {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

pub struct FrameDecoder<T> {
    assembler: FrameAssembler,
    marker: PhantomData<T>,
}

impl<T> FrameDecoder<T> {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            assembler: FrameAssembler::new(max_frame_bytes),
            marker: PhantomData,
        }
    }

    pub fn state(&self) -> &MessageHandlerState {
        self.assembler.state()
    }
}

impl<T> Default for FrameDecoder<T> {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

impl<T: DeserializeOwned> FrameDecoder<T> {
    pub fn push_chunk(&mut self, chunk: &[u8]) -> DecodeReport<T> {
        let raw = self.assembler.push_chunk(chunk);
        let mut report = DecodeReport {
            frames: Vec::with_capacity(raw.frames.len()),
            errors: raw.errors,
        };
        for body in raw.frames {
            match decode_body(&body) {
                Ok(parsed) => report.push_frame(parsed),
                Err(err) => report.push_error(err),
            }
        }
        report
    }
}
