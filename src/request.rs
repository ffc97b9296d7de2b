//! GATT request descriptions.
//!
//! A [`Request`] is an immutable description of one GATT operation plus its
//! priority and completion sink. Requests are built with the constructor
//! functions here and handed to a session for execution.

use bytes::Bytes;
use std::collections::VecDeque;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::config::WriteOptions;
use crate::error::Error;
use crate::transport::{Phy, PhyOptions};

/// Discriminant of a request's operation, used for queue filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    /// Read a characteristic value.
    ReadCharacteristic,
    /// Write a characteristic value, possibly fragmented.
    WriteCharacteristic,
    /// Read a descriptor value.
    ReadDescriptor,
    /// Write a descriptor value.
    WriteDescriptor,
    /// Enable or disable notifications.
    SetNotification,
    /// Enable or disable indications.
    SetIndication,
    /// Negotiate the ATT MTU.
    ChangeMtu,
    /// Read the signal strength.
    ReadRssi,
    /// Read the PHY pair.
    ReadPhy,
    /// Request a preferred PHY pair.
    SetPreferredPhy,
}

/// The operation a request performs, with its target and payload.
#[derive(Debug, Clone)]
pub(crate) enum RequestOp {
    ReadCharacteristic {
        service: Uuid,
        characteristic: Uuid,
    },
    WriteCharacteristic {
        service: Uuid,
        characteristic: Uuid,
        value: Bytes,
    },
    ReadDescriptor {
        service: Uuid,
        characteristic: Uuid,
        descriptor: Uuid,
    },
    WriteDescriptor {
        service: Uuid,
        characteristic: Uuid,
        descriptor: Uuid,
        value: Bytes,
    },
    SetNotification {
        service: Uuid,
        characteristic: Uuid,
        enable: bool,
    },
    SetIndication {
        service: Uuid,
        characteristic: Uuid,
        enable: bool,
    },
    ChangeMtu {
        mtu: u16,
    },
    ReadRssi,
    ReadPhy,
    SetPreferredPhy {
        options: PhyOptions,
    },
}

impl RequestOp {
    pub(crate) fn kind(&self) -> RequestKind {
        match self {
            Self::ReadCharacteristic { .. } => RequestKind::ReadCharacteristic,
            Self::WriteCharacteristic { .. } => RequestKind::WriteCharacteristic,
            Self::ReadDescriptor { .. } => RequestKind::ReadDescriptor,
            Self::WriteDescriptor { .. } => RequestKind::WriteDescriptor,
            Self::SetNotification { .. } => RequestKind::SetNotification,
            Self::SetIndication { .. } => RequestKind::SetIndication,
            Self::ChangeMtu { .. } => RequestKind::ChangeMtu,
            Self::ReadRssi => RequestKind::ReadRssi,
            Self::ReadPhy => RequestKind::ReadPhy,
            Self::SetPreferredPhy { .. } => RequestKind::SetPreferredPhy,
        }
    }
}

/// Successful result of a request, typed per operation kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestValue {
    /// Bytes read, or the full payload of a completed write.
    Bytes(Bytes),
    /// Negotiated MTU.
    Mtu(u16),
    /// Signal strength in dBm.
    Rssi(i16),
    /// (tx, rx) PHY pair.
    Phy(Phy, Phy),
    /// Whether notifications/indications ended up enabled.
    NotifyState(bool),
}

/// Completion sink: resolved exactly once per accepted request.
pub(crate) type RequestSink = oneshot::Sender<Result<RequestValue, Error>>;

/// An immutable description of one GATT operation.
///
/// Build with the constructors, adjust priority/write policy with the
/// builder methods, then enqueue via a session handle.
#[derive(Debug)]
pub struct Request {
    pub(crate) op: RequestOp,
    pub(crate) priority: i32,
    pub(crate) write_options: Option<WriteOptions>,
    pub(crate) sink: Option<RequestSink>,
    pub(crate) id: u64,
}

impl Request {
    fn new(op: RequestOp) -> Self {
        Self {
            op,
            priority: 0,
            write_options: None,
            sink: None,
            id: 0,
        }
    }

    /// Read a characteristic.
    pub fn read_characteristic(service: Uuid, characteristic: Uuid) -> Self {
        Self::new(RequestOp::ReadCharacteristic {
            service,
            characteristic,
        })
    }

    /// Write a characteristic.
    pub fn write_characteristic(
        service: Uuid,
        characteristic: Uuid,
        value: impl Into<Bytes>,
    ) -> Self {
        Self::new(RequestOp::WriteCharacteristic {
            service,
            characteristic,
            value: value.into(),
        })
    }

    /// Read a descriptor.
    pub fn read_descriptor(service: Uuid, characteristic: Uuid, descriptor: Uuid) -> Self {
        Self::new(RequestOp::ReadDescriptor {
            service,
            characteristic,
            descriptor,
        })
    }

    /// Write a descriptor.
    pub fn write_descriptor(
        service: Uuid,
        characteristic: Uuid,
        descriptor: Uuid,
        value: impl Into<Bytes>,
    ) -> Self {
        Self::new(RequestOp::WriteDescriptor {
            service,
            characteristic,
            descriptor,
            value: value.into(),
        })
    }

    /// Enable or disable notifications on a characteristic.
    pub fn set_notification(service: Uuid, characteristic: Uuid, enable: bool) -> Self {
        Self::new(RequestOp::SetNotification {
            service,
            characteristic,
            enable,
        })
    }

    /// Enable or disable indications on a characteristic.
    pub fn set_indication(service: Uuid, characteristic: Uuid, enable: bool) -> Self {
        Self::new(RequestOp::SetIndication {
            service,
            characteristic,
            enable,
        })
    }

    /// Negotiate the ATT MTU.
    pub fn change_mtu(mtu: u16) -> Self {
        Self::new(RequestOp::ChangeMtu { mtu })
    }

    /// Read the signal strength.
    pub fn read_rssi() -> Self {
        Self::new(RequestOp::ReadRssi)
    }

    /// Read the PHY pair.
    pub fn read_phy() -> Self {
        Self::new(RequestOp::ReadPhy)
    }

    /// Request a preferred PHY pair.
    pub fn set_preferred_phy(options: PhyOptions) -> Self {
        Self::new(RequestOp::SetPreferredPhy { options })
    }

    /// Set the priority. Higher runs sooner; equal priorities keep FIFO
    /// order. Defaults to 0.
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Attach a write policy, overriding the connection's default for the
    /// target characteristic.
    pub fn write_options(mut self, options: WriteOptions) -> Self {
        self.write_options = Some(options);
        self
    }

    /// The operation discriminant.
    pub fn kind(&self) -> RequestKind {
        self.op.kind()
    }
}

/// Insert a request keeping the queue sorted by descending priority, FIFO
/// among equal priorities.
pub(crate) fn insert_by_priority(queue: &mut VecDeque<Request>, request: Request) {
    let position = queue
        .iter()
        .position(|queued| queued.priority < request.priority)
        .unwrap_or(queue.len());
    queue.insert(position, request);
}

/// Split a payload into chunks of at most `size` bytes.
///
/// Slicing `Bytes` shares the underlying buffer, so fragmentation never
/// copies payload data.
pub(crate) fn split_chunks(payload: &Bytes, size: usize) -> VecDeque<Bytes> {
    let size = size.max(1);
    let mut chunks = VecDeque::new();
    let mut offset = 0;
    while offset < payload.len() {
        let end = (offset + size).min(payload.len());
        chunks.push_back(payload.slice(offset..end));
        offset = end;
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn request_with_priority(priority: i32, id: u64) -> Request {
        let mut request = Request::read_rssi().priority(priority);
        request.id = id;
        request
    }

    #[test]
    fn test_insert_by_priority_stable() {
        let mut queue = VecDeque::new();
        insert_by_priority(&mut queue, request_with_priority(0, 1));
        insert_by_priority(&mut queue, request_with_priority(5, 2));
        insert_by_priority(&mut queue, request_with_priority(0, 3));
        insert_by_priority(&mut queue, request_with_priority(5, 4));
        insert_by_priority(&mut queue, request_with_priority(-1, 5));

        let order: Vec<u64> = queue.iter().map(|r| r.id).collect();
        assert_eq!(order, vec![2, 4, 1, 3, 5]);
    }

    #[test]
    fn test_split_chunks_boundaries() {
        let chunk = 20usize;
        for len in [0usize, 19, 20, 21, 100] {
            let payload = Bytes::from(vec![0xA5u8; len]);
            let chunks = split_chunks(&payload, chunk);
            assert_eq!(chunks.len(), (len + chunk - 1) / chunk);
            let total: usize = chunks.iter().map(Bytes::len).sum();
            assert_eq!(total, len);
            for c in chunks.iter() {
                assert!(c.len() <= chunk && !c.is_empty());
            }
        }
    }

    #[test]
    fn test_split_chunks_round_trip() {
        let payload = Bytes::from((0u8..=49).collect::<Vec<u8>>());
        let chunks = split_chunks(&payload, 20);
        let sizes: Vec<usize> = chunks.iter().map(Bytes::len).collect();
        assert_eq!(sizes, vec![20, 20, 10]);

        let mut reassembled = Vec::new();
        for c in chunks {
            reassembled.extend_from_slice(&c);
        }
        assert_eq!(Bytes::from(reassembled), payload);
    }

    proptest! {
        #[test]
        fn prop_priority_order_is_stable_sort(priorities in proptest::collection::vec(-3i32..3, 0..40)) {
            let mut queue = VecDeque::new();
            for (i, &p) in priorities.iter().enumerate() {
                insert_by_priority(&mut queue, request_with_priority(p, i as u64));
            }

            // Expected: stable sort by descending priority, ids as tiebreak
            // witness of enqueue order.
            let mut expected: Vec<(i32, u64)> = priorities
                .iter()
                .enumerate()
                .map(|(i, &p)| (p, i as u64))
                .collect();
            expected.sort_by_key(|&(p, _)| std::cmp::Reverse(p));

            let actual: Vec<(i32, u64)> = queue.iter().map(|r| (r.priority, r.id)).collect();
            prop_assert_eq!(actual, expected);
        }

        #[test]
        fn prop_chunks_reassemble(payload in proptest::collection::vec(any::<u8>(), 0..200), size in 1usize..40) {
            let payload = Bytes::from(payload);
            let chunks = split_chunks(&payload, size);
            let mut reassembled = Vec::new();
            for c in chunks {
                prop_assert!(c.len() <= size);
                reassembled.extend_from_slice(&c);
            }
            prop_assert_eq!(Bytes::from(reassembled), payload);
        }
    }
}
