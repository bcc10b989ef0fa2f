//! Counter state machine.
//!
//! The smallest useful `StateMachine`: a single `i32` that `INCREMENT`
//! commands bump and `GET` queries read. Replies and snapshots carry the
//! value as 4 big-endian bytes.

use crate::error::{RaftError, Result};
use crate::id::{GroupId, PeerId};
use crate::snapshot::Snapshot;
use crate::statemachine::StateMachine;
use crate::types::{ClientRequest, RequestKind, TermIndex};
use bytes::Bytes;

pub const INCREMENT: &[u8] = b"INCREMENT";
pub const GET: &[u8] = b"GET";

#[derive(Debug, Default)]
pub struct CounterStateMachine {
    value: i32,
    applied: TermIndex,
    server: Option<(PeerId, GroupId)>,
}

impl CounterStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn value(&self) -> i32 {
        self.value
    }

    /// Server this instance was initialized for.
    pub fn server_id(&self) -> Option<PeerId> {
        self.server.map(|(id, _)| id)
    }

    /// Decode a reply (or snapshot payload) produced by this state machine.
    pub fn decode_value(bytes: &[u8]) -> Result<i32> {
        let raw: [u8; 4] = bytes.try_into().map_err(|_| RaftError::InvalidRequest {
            reason: format!("counter value must be 4 bytes, got {}", bytes.len()),
        })?;
        Ok(i32::from_be_bytes(raw))
    }

    fn encode_value(value: i32) -> Bytes {
        Bytes::copy_from_slice(&value.to_be_bytes())
    }

    fn reset(&mut self, latest: Option<&Snapshot>) -> Result<TermIndex> {
        self.value = 0;
        self.applied = TermIndex::ZERO;
        if let Some(snapshot) = latest {
            self.load(snapshot)?;
        }
        Ok(self.applied)
    }
}

impl StateMachine for CounterStateMachine {
    fn initialize(
        &mut self,
        server_id: PeerId,
        group_id: GroupId,
        latest: Option<&Snapshot>,
    ) -> Result<TermIndex> {
        self.server = Some((server_id, group_id));
        self.reset(latest)
    }

    fn reinitialize(&mut self, latest: Option<&Snapshot>) -> Result<TermIndex> {
        self.reset(latest)
    }

    fn start_transaction(&self, request: &ClientRequest) -> Result<Bytes> {
        if request.kind != RequestKind::Write || request.message.as_ref() != INCREMENT {
            return Err(RaftError::InvalidRequest {
                reason: format!(
                    "counter accepts only INCREMENT writes, got {:?}",
                    String::from_utf8_lossy(&request.message)
                ),
            });
        }
        Ok(request.message.clone())
    }

    fn apply_transaction(&mut self, at: TermIndex, command: &Bytes) -> Result<Bytes> {
        if command.as_ref() != INCREMENT {
            return Err(RaftError::InvalidRequest {
                reason: format!("unknown counter command at {}", at),
            });
        }
        self.value = self.value.wrapping_add(1);
        self.applied = at;
        Ok(Self::encode_value(self.value))
    }

    fn query(&self, request: &Bytes) -> Result<Bytes> {
        if request.as_ref() != GET {
            return Err(RaftError::InvalidRequest {
                reason: format!("unknown counter query {:?}", String::from_utf8_lossy(request)),
            });
        }
        Ok(Self::encode_value(self.value))
    }

    fn take_snapshot(&self) -> Result<Bytes> {
        Ok(Self::encode_value(self.value))
    }

    fn load(&mut self, snapshot: &Snapshot) -> Result<()> {
        self.value = Self::decode_value(&snapshot.data)?;
        self.applied = snapshot.meta.last_included;
        Ok(())
    }

    fn last_applied(&self) -> TermIndex {
        self.applied
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::ClientId;
    use crate::types::{LogIndex, Membership, Term};

    fn at(index: u64) -> TermIndex {
        TermIndex::new(Term(1), LogIndex(index))
    }

    #[test]
    fn test_increment_replies_new_value() {
        let mut sm = CounterStateMachine::new();
        let cmd = Bytes::from_static(INCREMENT);

        let reply = sm.apply_transaction(at(1), &cmd).unwrap();
        assert_eq!(CounterStateMachine::decode_value(&reply).unwrap(), 1);
        let reply = sm.apply_transaction(at(2), &cmd).unwrap();
        assert_eq!(reply.as_ref(), &2i32.to_be_bytes());
        assert_eq!(sm.last_applied(), at(2));
    }

    #[test]
    fn test_start_transaction_validates() {
        let sm = CounterStateMachine::new();
        let client = ClientId::random();
        assert!(sm
            .start_transaction(&ClientRequest::write(client, 1, INCREMENT))
            .is_ok());
        assert!(matches!(
            sm.start_transaction(&ClientRequest::write(client, 2, "DECREMENT")),
            Err(RaftError::InvalidRequest { .. })
        ));
        assert!(sm
            .start_transaction(&ClientRequest::read(client, 3, INCREMENT))
            .is_err());
    }

    #[test]
    fn test_query_get() {
        let mut sm = CounterStateMachine::new();
        sm.apply_transaction(at(1), &Bytes::from_static(INCREMENT))
            .unwrap();
        let value = sm.query(&Bytes::from_static(GET)).unwrap();
        assert_eq!(CounterStateMachine::decode_value(&value).unwrap(), 1);
        assert!(sm.query(&Bytes::from_static(b"PUT")).is_err());
    }

    #[test]
    fn test_snapshot_load_matches_replay() {
        let cmd = Bytes::from_static(INCREMENT);
        let mut replayed = CounterStateMachine::new();
        for i in 1..=10 {
            replayed.apply_transaction(at(i), &cmd).unwrap();
        }

        let snapshot = Snapshot::new(
            replayed.last_applied(),
            Membership::default(),
            replayed.take_snapshot().unwrap(),
        );
        let mut loaded = CounterStateMachine::new();
        let position = loaded
            .initialize(PeerId::random(), GroupId::random(), Some(&snapshot))
            .unwrap();

        assert_eq!(position, at(10));
        assert_eq!(loaded.value(), replayed.value());

        // Both continue identically
        let a = replayed.apply_transaction(at(11), &cmd).unwrap();
        let b = loaded.apply_transaction(at(11), &cmd).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_reinitialize_without_snapshot_resets() {
        let mut sm = CounterStateMachine::new();
        sm.apply_transaction(at(1), &Bytes::from_static(INCREMENT))
            .unwrap();
        assert_eq!(sm.reinitialize(None).unwrap(), TermIndex::ZERO);
        assert_eq!(sm.value(), 0);
    }
}
