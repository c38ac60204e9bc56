use super::{Decoder, Encoder, Error, FrameReader, FrameWriter, Result};

const SEGMENT_REQUEST: u8 = 1;
const SEGMENT_DATA: u8 = 2;
const SEGMENT_ABSENT: u8 = 3;
const CANCEL_REQUEST: u8 = 4;
const ANNOUNCEMENT: u8 = 5;

/// Control messages exchanged between peer links. Segment payload travels
/// separately, as raw messages following a `SegmentData` header.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum PeerCommand {
    SegmentRequest {
        segment_id: String,
        byte_offset: Option<u64>,
    },
    SegmentData {
        segment_id: String,
        total_bytes: u64,
    },
    SegmentAbsent {
        segment_id: String,
    },
    CancelRequest {
        segment_id: String,
    },
    Announcement {
        loaded: Vec<String>,
        loading_via_fallback: Vec<String>,
    },
}

impl PeerCommand {
    pub fn name(&self) -> &'static str {
        match self {
            PeerCommand::SegmentRequest { .. } => "segment-request",
            PeerCommand::SegmentData { .. } => "segment-data",
            PeerCommand::SegmentAbsent { .. } => "segment-absent",
            PeerCommand::CancelRequest { .. } => "cancel-request",
            PeerCommand::Announcement { .. } => "announcement",
        }
    }
}

impl Encoder for PeerCommand {
    fn encode(&self) -> Result<Vec<u8>> {
        let frame = match self {
            PeerCommand::SegmentRequest {
                segment_id,
                byte_offset,
            } => {
                let mut w = FrameWriter::new(SEGMENT_REQUEST);
                w.string(segment_id);
                w.opt_u64(*byte_offset);
                w
            }
            PeerCommand::SegmentData {
                segment_id,
                total_bytes,
            } => {
                let mut w = FrameWriter::new(SEGMENT_DATA);
                w.string(segment_id);
                w.u64(*total_bytes);
                w
            }
            PeerCommand::SegmentAbsent { segment_id } => {
                let mut w = FrameWriter::new(SEGMENT_ABSENT);
                w.string(segment_id);
                w
            }
            PeerCommand::CancelRequest { segment_id } => {
                let mut w = FrameWriter::new(CANCEL_REQUEST);
                w.string(segment_id);
                w
            }
            PeerCommand::Announcement {
                loaded,
                loading_via_fallback,
            } => {
                let mut w = FrameWriter::new(ANNOUNCEMENT);
                w.strings(loaded);
                w.strings(loading_via_fallback);
                w
            }
        };
        Ok(frame.finish())
    }
}

impl Decoder for PeerCommand {
    fn decode(buf: &[u8]) -> Result<Self> {
        let (mut r, command_type) = FrameReader::open(buf)?;
        let command = match command_type {
            SEGMENT_REQUEST => PeerCommand::SegmentRequest {
                segment_id: r.string()?,
                byte_offset: r.opt_u64()?,
            },
            SEGMENT_DATA => PeerCommand::SegmentData {
                segment_id: r.string()?,
                total_bytes: r.u64()?,
            },
            SEGMENT_ABSENT => PeerCommand::SegmentAbsent {
                segment_id: r.string()?,
            },
            CANCEL_REQUEST => PeerCommand::CancelRequest {
                segment_id: r.string()?,
            },
            ANNOUNCEMENT => PeerCommand::Announcement {
                loaded: r.strings()?,
                loading_via_fallback: r.strings()?,
            },
            other => return Err(Error::UnknownType(other)),
        };
        r.finish()?;
        Ok(command)
    }
}

/// Encode a command into a single frame.
pub fn encode_command(command: &PeerCommand) -> Vec<u8> {
    // Encoding into an in-memory buffer cannot fail.
    command.encode().unwrap_or_default()
}

/// Interpret an incoming message. `None` means the message is not a
/// well-formed control frame and should be treated as segment payload.
pub fn decode_command(buf: &[u8]) -> Option<PeerCommand> {
    PeerCommand::decode(buf).ok()
}
