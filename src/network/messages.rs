//! The tagged message union exchanged between peers.
//!
//! The wire format is implementation-defined but stable within a session: every
//! message is bincode-encoded with fixed-integer sizes (see [`codec`]) and carries a
//! session magic in its header so stray packets from other sessions are rejected at
//! the door.
//!
//! [`codec`]: crate::network::codec

use serde::{Deserialize, Serialize};

use crate::snapshot::ChecksumTuple;
use crate::{Frame, PlayerId};

/// Header prepended to every message of a session.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct MessageHeader {
    /// Session magic; receivers drop messages whose magic does not match.
    pub magic: u16,
}

/// A single player input for a single frame.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputMessage {
    /// The frame this input belongs to.
    pub frame: Frame,
    /// The player that produced the input.
    pub player: PlayerId,
    /// Opaque input payload.
    pub bytes: Vec<u8>,
    /// Sender wall time in milliseconds, for input latency estimation.
    pub send_time: u128,
}

impl std::fmt::Debug for InputMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Destructure to ensure all fields are included when new fields are added.
        let Self {
            frame,
            player,
            bytes,
            send_time,
        } = self;
        f.debug_struct("InputMessage")
            .field("frame", frame)
            .field("player", player)
            .field("bytes", &BytesDebug(bytes))
            .field("send_time", send_time)
            .finish()
    }
}

struct BytesDebug<'a>(&'a [u8]);

impl std::fmt::Debug for BytesDebug<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("0x")?;
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Multiple inputs coalesced into one packet by the outgoing batcher.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct InputBatch {
    /// The batched inputs, in send order.
    pub entries: Vec<InputMessage>,
}

/// Per-frame checksum exchange used to detect divergence.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncTest {
    /// The frame the checksums were computed at.
    pub frame: Frame,
    /// The sender's checksum ladder for that frame.
    pub checksums: ChecksumTuple,
    /// Sender wall time in milliseconds; newer values replace older on re-delivery.
    pub send_time: u128,
}

/// Latency probe.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Ping {
    /// Unique id so late echoes match their probe.
    pub ping_id: u32,
    /// Sender monotonic timestamp in milliseconds.
    pub t0: u128,
}

/// Echo of a [`Ping`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Pong {
    /// The echoed probe id.
    pub ping_id: u32,
    /// The echoed original timestamp.
    pub t0: u128,
    /// Responder wall time in milliseconds.
    pub t1: u128,
}

/// One packet of a bandwidth measurement burst.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct BandwidthTest {
    /// Identifies the burst this packet belongs to.
    pub test_id: u32,
    /// Position within the burst.
    pub packet_id: u32,
    /// Filler payload (nominally 1 KB).
    pub payload: Vec<u8>,
}

impl std::fmt::Debug for BandwidthTest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let Self {
            test_id,
            packet_id,
            payload,
        } = self;
        f.debug_struct("BandwidthTest")
            .field("test_id", test_id)
            .field("packet_id", packet_id)
            .field("payload_len", &payload.len())
            .finish()
    }
}

/// Acknowledgement of a [`BandwidthTest`] packet.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct BandwidthAck {
    /// The acknowledged burst.
    pub test_id: u32,
    /// The acknowledged packet.
    pub packet_id: u32,
}

/// Periodic liveness beacon from the current host.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostHeartbeat {
    /// The host announcing itself.
    pub host: PlayerId,
    /// The host's current frame.
    pub frame: Frame,
    /// Host wall time in milliseconds.
    pub t: u128,
}

/// Why a host migration was initiated.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MigrationReason {
    /// The host stopped sending heartbeats.
    HostTimeout,
    /// The transport reported the host's connection as lost.
    HostDisconnected,
    /// The host left deliberately.
    HostDeparted,
}

/// Broadcast by the self-elected proposer to start a migration.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationAnnounce {
    /// The proposed new host.
    pub new_host: PlayerId,
    /// Why the migration was started.
    pub reason: MigrationReason,
    /// The frame the proposer observed when it detected host death.
    pub frame: Frame,
}

/// Request for a peer's simulation state at (or nearest below) a frame.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct StateRequest {
    /// Correlates the response to this request.
    pub request_id: u32,
    /// The requested frame; [`Frame::NULL`] asks for the responder's latest state.
    pub frame: Frame,
}

/// Response to a [`StateRequest`].
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateResponse {
    /// The request this responds to.
    pub request_id: u32,
    /// The frame the carried state belongs to.
    pub frame: Frame,
    /// The serialized simulation state; `None` if the responder could not supply it.
    pub state: Option<Vec<u8>>,
    /// Checksums for validating the carried state, when the responder has them.
    pub checksums: Option<ChecksumTuple>,
}

impl std::fmt::Debug for StateResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let Self {
            request_id,
            frame,
            state,
            checksums,
        } = self;
        f.debug_struct("StateResponse")
            .field("request_id", request_id)
            .field("frame", frame)
            .field("state_len", &state.as_ref().map(Vec::len))
            .field("checksums", checksums)
            .finish()
    }
}

/// Broadcast by the new host once it holds a validated state and accepts authority.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostReady {
    /// The new host.
    pub host: PlayerId,
    /// The frame the session resumes from.
    pub frame: Frame,
}

/// All message bodies the runtime exchanges.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageBody {
    /// A single player input.
    Input(InputMessage),
    /// Batched player inputs.
    InputBatch(InputBatch),
    /// Checksum exchange.
    SyncTest(SyncTest),
    /// Latency probe.
    Ping(Ping),
    /// Latency probe echo.
    Pong(Pong),
    /// Bandwidth burst packet.
    BandwidthTest(BandwidthTest),
    /// Bandwidth burst ack.
    BandwidthAck(BandwidthAck),
    /// Host liveness beacon.
    HostHeartbeat(HostHeartbeat),
    /// Migration start announcement.
    MigrationAnnounce(MigrationAnnounce),
    /// State transfer request.
    StateRequest(StateRequest),
    /// State transfer response.
    StateResponse(StateResponse),
    /// New-host cutover signal.
    HostReady(HostReady),
    /// Connection keep-alive when nothing else is flowing.
    KeepAlive,
}

/// A message a [`Transport`] sends and receives.
///
/// [`Transport`]: crate::Transport
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// The session header.
    pub header: MessageHeader,
    /// The payload.
    pub body: MessageBody,
}

impl Message {
    /// Wraps a body with the given session magic.
    #[must_use]
    pub fn new(magic: u16, body: MessageBody) -> Self {
        Self {
            header: MessageHeader { magic },
            body,
        }
    }
}

// #########
// # TESTS #
// #########

#[cfg(test)]
#[allow(clippy::panic, clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::network::codec;

    #[test]
    fn header_default_magic_is_zero() {
        assert_eq!(MessageHeader::default().magic, 0);
    }

    #[test]
    fn input_debug_hides_raw_bytes() {
        let msg = InputMessage {
            frame: Frame::new(3),
            player: PlayerId::new(1),
            bytes: vec![0xDE, 0xAD],
            send_time: 99,
        };
        let debug = format!("{msg:?}");
        assert!(debug.contains("0xdead"));
        assert!(debug.contains("frame"));
    }

    #[test]
    fn state_response_debug_shows_length_not_contents() {
        let msg = StateResponse {
            request_id: 7,
            frame: Frame::new(100),
            state: Some(vec![0u8; 4096]),
            checksums: None,
        };
        let debug = format!("{msg:?}");
        assert!(debug.contains("4096"));
        assert!(!debug.contains("0, 0, 0"));
    }

    #[test]
    fn message_roundtrips_through_codec() {
        let msg = Message::new(
            0x5A5A,
            MessageBody::MigrationAnnounce(MigrationAnnounce {
                new_host: PlayerId::new(2),
                reason: MigrationReason::HostTimeout,
                frame: Frame::new(1000),
            }),
        );
        let bytes = codec::encode(&msg).unwrap();
        let decoded: Message = codec::decode_value(&bytes).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn batch_roundtrips_through_codec() {
        let batch = InputBatch {
            entries: vec![
                InputMessage {
                    frame: Frame::new(10),
                    player: PlayerId::new(0),
                    bytes: vec![1, 2],
                    send_time: 5,
                },
                InputMessage {
                    frame: Frame::new(11),
                    player: PlayerId::new(0),
                    bytes: vec![3, 4],
                    send_time: 6,
                },
            ],
        };
        let msg = Message::new(1, MessageBody::InputBatch(batch.clone()));
        let bytes = codec::encode(&msg).unwrap();
        let decoded: Message = codec::decode_value(&bytes).unwrap();
        match decoded.body {
            MessageBody::InputBatch(decoded_batch) => assert_eq!(decoded_batch, batch),
            other => panic!("unexpected body: {other:?}"),
        }
    }

    #[test]
    fn sync_test_roundtrips_with_partial_ladder() {
        let msg = Message::new(
            2,
            MessageBody::SyncTest(SyncTest {
                frame: Frame::new(30),
                checksums: ChecksumTuple {
                    basic: 1,
                    enhanced: 2,
                    deep: Some(3),
                    native: None,
                },
                send_time: 123,
            }),
        );
        let bytes = codec::encode(&msg).unwrap();
        let decoded: Message = codec::decode_value(&bytes).unwrap();
        assert_eq!(msg, decoded);
    }
}
