//! Frame representation shared by the ingress and egress stages.

use crate::buffer_pool::{lease, FrameRef};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

static FRAME_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Length of the switch header preceding every payload.
pub const HEADER_LEN: usize = 4;

/// Fixed header carried by every frame entering the switch: big-endian egress
/// port, traffic class, one reserved byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwitchHeader {
    pub egress_port: u16,
    pub traffic_class: u8,
}

impl SwitchHeader {
    /// Decode the header from the start of a datagram. `None` if the datagram is
    /// shorter than [`HEADER_LEN`].
    pub fn parse(bytes: &[u8]) -> Option<SwitchHeader> {
        if bytes.len() < HEADER_LEN {
            return None;
        }
        Some(SwitchHeader {
            egress_port: u16::from_be_bytes([bytes[0], bytes[1]]),
            traffic_class: bytes[2],
        })
    }

    /// Encode the header into the first [`HEADER_LEN`] bytes of `out`.
    pub fn write(&self, out: &mut [u8]) {
        let port = self.egress_port.to_be_bytes();
        out[0] = port[0];
        out[1] = port[1];
        out[2] = self.traffic_class;
        out[3] = 0;
    }
}

/// One work unit travelling through the switch: the parsed header, the full
/// datagram bytes, and the ingress timestamp used for latency accounting.
#[derive(Debug, Clone)]
pub struct Frame {
    pub id: u64,
    pub header: SwitchHeader,
    buffer: FrameRef,
    pub ingress_at: Instant,
}

impl Frame {
    /// Wrap a received datagram. `None` if it is too short to carry the header.
    pub fn from_datagram(buffer: FrameRef) -> Option<Frame> {
        let header = SwitchHeader::parse(buffer.as_slice())?;
        Some(Frame {
            id: FRAME_ID_COUNTER.fetch_add(1, Ordering::Relaxed),
            header,
            buffer,
            ingress_at: Instant::now(),
        })
    }

    /// Build a frame from scratch. Used by tests and traffic generators; the hot
    /// path goes through [`Frame::from_datagram`].
    pub fn new(egress_port: u16, traffic_class: u8, payload: &[u8]) -> Frame {
        let header = SwitchHeader {
            egress_port,
            traffic_class,
        };
        let total = HEADER_LEN + payload.len();
        let mut writable = lease(total);
        header.write(writable.as_mut_slice());
        writable.as_mut_slice()[HEADER_LEN..total].copy_from_slice(payload);
        Frame {
            id: FRAME_ID_COUNTER.fetch_add(1, Ordering::Relaxed),
            header,
            buffer: writable.freeze(total),
            ingress_at: Instant::now(),
        }
    }

    /// Payload bytes after the switch header.
    pub fn payload(&self) -> &[u8] {
        &self.buffer.as_slice()[HEADER_LEN..]
    }

    /// Total datagram length including the header.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.len() <= HEADER_LEN
    }
}
