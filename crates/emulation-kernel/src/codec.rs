//! Binary envelope for shipping one vertex's schedule to its handler.
//!
//! A frame is a little-endian `u32` length followed by a bincode-encoded
//! [`WireSchedule`]. Payload bytes (file content, inline executables) travel as
//! raw byte vectors inside the closed [`Action`](crate::schedule::Action) enum;
//! nothing received is ever turned into code.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::error::CodecError;
use crate::schedule::{Schedule, ScheduleEntry};

pub const WIRE_VERSION: u16 = 1;

const LEN_PREFIX: usize = 4;

/// Upper bound on a single frame, inline executables included.
pub const MAX_FRAME_BYTES: usize = 256 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireSchedule {
    pub version: u16,
    pub vertex: String,
    /// Entries in arena order (`entries[i].id == i`)
    pub entries: Vec<ScheduleEntry>,
}

impl From<&Schedule> for WireSchedule {
    fn from(schedule: &Schedule) -> Self {
        Self {
            version: WIRE_VERSION,
            vertex: schedule.owner().to_string(),
            entries: schedule.arena().to_vec(),
        }
    }
}

impl WireSchedule {
    /// Validate the envelope and rebuild the ordered schedule.
    pub fn into_schedule(self) -> Result<Schedule, CodecError> {
        if self.version != WIRE_VERSION {
            return Err(CodecError::Version(self.version));
        }
        for (idx, entry) in self.entries.iter().enumerate() {
            if entry.id as usize != idx {
                return Err(CodecError::Invalid(format!(
                    "entry {idx} carries id {}",
                    entry.id
                )));
            }
        }
        Schedule::from_entries(self.vertex, self.entries)
            .map_err(|e| CodecError::Invalid(e.to_string()))
    }
}

/// Length prefix for a payload of `size` bytes.
fn frame_len(size: usize) -> Result<u32, CodecError> {
    u32::try_from(size)
        .ok()
        .filter(|len| *len as usize <= MAX_FRAME_BYTES)
        .ok_or(CodecError::TooLarge {
            size,
            limit: MAX_FRAME_BYTES,
        })
}

pub fn encode_frame(schedule: &Schedule) -> Result<Vec<u8>, CodecError> {
    let payload = bincode::serialize(&WireSchedule::from(schedule))?;
    let len = frame_len(payload.len())?;
    let mut frame = Vec::with_capacity(LEN_PREFIX + payload.len());
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(&payload);
    trace!(vertex = %schedule.owner(), bytes = frame.len(), "Encoded schedule frame");
    Ok(frame)
}

pub fn decode_frame(frame: &[u8]) -> Result<Schedule, CodecError> {
    let Some((prefix, payload)) = frame.split_first_chunk::<LEN_PREFIX>() else {
        return Err(CodecError::Truncated {
            expected: LEN_PREFIX,
            actual: frame.len(),
        });
    };
    let len = u32::from_le_bytes(*prefix) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(CodecError::TooLarge {
            size: len,
            limit: MAX_FRAME_BYTES,
        });
    }
    if payload.len() < len {
        return Err(CodecError::Truncated {
            expected: len,
            actual: payload.len(),
        });
    }
    let wire: WireSchedule = bincode::deserialize(&payload[..len])?;
    wire.into_schedule()
}

/// Read one frame from a byte stream.
pub async fn read_frame<R>(reader: &mut R) -> Result<Schedule, CodecError>
where
    R: AsyncRead + Unpin,
{
    let len = reader
        .read_u32_le()
        .await
        .map_err(|e| CodecError::Invalid(format!("read frame length: {e}")))? as usize;
    if len > MAX_FRAME_BYTES {
        return Err(CodecError::TooLarge {
            size: len,
            limit: MAX_FRAME_BYTES,
        });
    }
    let mut buffer = Vec::with_capacity(len);
    let read = reader
        .take(len as u64)
        .read_to_end(&mut buffer)
        .await
        .map_err(|e| CodecError::Invalid(format!("read frame payload: {e}")))?;
    if read < len {
        return Err(CodecError::Truncated {
            expected: len,
            actual: read,
        });
    }
    let wire: WireSchedule = bincode::deserialize(&buffer)?;
    wire.into_schedule()
}

/// Write one frame to a byte stream.
pub async fn write_frame<W>(writer: &mut W, schedule: &Schedule) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_frame(schedule)?;
    writer
        .write_all(&frame)
        .await
        .map_err(|e| CodecError::Invalid(format!("write frame: {e}")))?;
    writer
        .flush()
        .await
        .map_err(|e| CodecError::Invalid(format!("flush frame: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::{Action, ExecutableRef, ResumeTargets};

    fn sample() -> Schedule {
        let mut schedule = Schedule::new("h1");
        schedule
            .schedule_action(
                f64::NEG_INFINITY,
                Action::DropContent {
                    path: "etc/motd".into(),
                    content: vec![0, 159, 146, 150, 255],
                    mode: Some(0o644),
                },
            )
            .unwrap();
        schedule
            .schedule_action(
                -1.0,
                Action::RunExecutable {
                    program: ExecutableRef::Inline {
                        name: "setup".into(),
                        bytes: b"\x7fELF\x00\x01".to_vec(),
                    },
                    args: vec!["--fast".into()],
                    timeout_seconds: Some(30.0),
                },
            )
            .unwrap();
        schedule.schedule_action(5.0, Action::Break).unwrap();
        schedule
            .schedule_action(
                5.0,
                Action::ResumeMarker {
                    targets: ResumeTargets::Vertices(vec!["h2".into()]),
                },
            )
            .unwrap();
        schedule
    }

    #[test]
    fn frame_carries_binary_payloads_and_order() {
        let schedule = sample();
        let frame = encode_frame(&schedule).unwrap();
        let decoded = decode_frame(&frame).unwrap();
        assert_eq!(decoded, schedule);
        let kinds: Vec<_> = decoded.iter().map(|e| e.action.kind()).collect();
        assert_eq!(kinds.last(), Some(&crate::schedule::ActionKind::Break));
    }

    #[test]
    fn truncated_frames_are_rejected() {
        let frame = encode_frame(&sample()).unwrap();
        assert!(matches!(
            decode_frame(&frame[..2]),
            Err(CodecError::Truncated { expected: 4, .. })
        ));
        assert!(matches!(
            decode_frame(&frame[..frame.len() - 1]),
            Err(CodecError::Truncated { .. })
        ));
    }

    #[test]
    fn oversized_length_prefix_is_rejected() {
        let mut frame = encode_frame(&sample()).unwrap();
        frame[..LEN_PREFIX].copy_from_slice(&u32::MAX.to_le_bytes());
        assert!(matches!(
            decode_frame(&frame),
            Err(CodecError::TooLarge { size, limit: MAX_FRAME_BYTES }) if size == u32::MAX as usize
        ));
    }

    #[test]
    fn length_prefix_never_truncates() {
        assert_eq!(frame_len(MAX_FRAME_BYTES).unwrap() as usize, MAX_FRAME_BYTES);
        assert!(matches!(
            frame_len(MAX_FRAME_BYTES + 1),
            Err(CodecError::TooLarge { size, .. }) if size == MAX_FRAME_BYTES + 1
        ));
        let past_u32 = u32::MAX as usize + 17;
        assert!(matches!(
            frame_len(past_u32),
            Err(CodecError::TooLarge { size, .. }) if size == past_u32
        ));
    }

    #[tokio::test]
    async fn short_streams_report_the_bytes_received() {
        let frame = encode_frame(&sample()).unwrap();
        let cut = frame.len() - 3;
        let mut reader = &frame[..cut];
        match read_frame(&mut reader).await {
            Err(CodecError::Truncated { expected, actual }) => {
                assert_eq!(expected, frame.len() - LEN_PREFIX);
                assert_eq!(actual, cut - LEN_PREFIX);
            }
            other => panic!("expected a truncated frame, got {other:?}"),
        }
    }

    #[test]
    fn unknown_versions_are_rejected() {
        let mut wire = WireSchedule::from(&sample());
        wire.version = 9;
        assert!(matches!(wire.into_schedule(), Err(CodecError::Version(9))));
    }

    #[test]
    fn reordered_arena_is_invalid() {
        let mut wire = WireSchedule::from(&sample());
        wire.entries.swap(0, 1);
        assert!(matches!(wire.into_schedule(), Err(CodecError::Invalid(_))));
    }

    #[test]
    fn out_of_range_entries_are_rejected_on_decode() {
        let mut wire = WireSchedule::from(&sample());
        wire.entries[2].start_time = 1.0e13;
        assert!(matches!(wire.into_schedule(), Err(CodecError::Invalid(_))));

        let mut wire = WireSchedule::from(&sample());
        wire.entries[0].action = Action::Pause { duration: 1.0e20 };
        assert!(matches!(wire.into_schedule(), Err(CodecError::Invalid(_))));
    }

    #[tokio::test]
    async fn frames_stream_over_async_io() {
        let (mut client, mut server) = tokio::io::duplex(64 * 1024);
        let schedule = sample();
        write_frame(&mut client, &schedule).await.unwrap();
        let received = read_frame(&mut server).await.unwrap();
        assert_eq!(received, schedule);
    }
}
