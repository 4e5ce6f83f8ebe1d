/// Local-completion tracking.
///
/// A remote request that needs local memory work (every element of a bulk
/// read, a load-reserve, an AMO) opens one record here. Each element's local
/// operation gets its own `LocalReqId`; the engine reports completions by that
/// id, and the record is handed back exactly once, when the last element
/// lands. The same mechanism gathers the payload of an outgoing bulk write.
use std::collections::HashMap;

use crate::error::{Result, RmcError};
use crate::memory::LocalReqId;
use crate::packet::{Flags, OpKind};
use crate::PeId;

/// Who a record is working for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKey {
    /// A request received from `src` under correlation id `id`.
    Remote { src: PeId, id: u32 },
    /// Payload gather for a bulk write this PE is about to send.
    Gather { seq: u64 },
}

impl std::fmt::Display for TrackKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrackKey::Remote { src, id } => write!(f, "pe{}#{}", src, id),
            TrackKey::Gather { seq } => write!(f, "gather#{}", seq),
        }
    }
}

/// Request metadata needed once all elements are in.
#[derive(Debug, Clone)]
pub struct TrackedRequest {
    pub key: TrackKey,
    pub kind: OpKind,
    pub src_addr: u64,
    pub dest_addr: u64,
    pub size: u32,
    pub nelem: u32,
    pub stride: u32,
    pub flags: Flags,
    pub aq: bool,
    pub rl: bool,
}

/// A record whose every element has completed.
#[derive(Debug)]
pub struct FinishedRecord {
    pub req: TrackedRequest,
    pub buffer: Vec<u8>,
}

struct Record {
    req: TrackedRequest,
    buffer: Vec<u8>,
    completed: u32,
}

#[derive(Default)]
pub struct LocalCompletionTracker {
    records: HashMap<TrackKey, Record>,
    /// local request → (record, element index)
    elements: HashMap<LocalReqId, (TrackKey, u32)>,
    next_req: LocalReqId,
}

impl LocalCompletionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&mut self, req: TrackedRequest) -> Result<()> {
        if self.records.contains_key(&req.key) {
            return Err(RmcError::DuplicateRecord(req.key.to_string()));
        }
        let len = req.size as usize * req.nelem as usize;
        self.records.insert(
            req.key,
            Record {
                req,
                buffer: vec![0u8; len],
                completed: 0,
            },
        );
        Ok(())
    }

    /// Allocate the local request id for element `idx` of `key`.
    pub fn issue_element(&mut self, key: TrackKey, idx: u32) -> LocalReqId {
        let req = self.next_req;
        self.next_req = self.next_req.wrapping_add(1);
        self.elements.insert(req, (key, idx));
        req
    }

    pub fn on_element_complete(
        &mut self,
        req: LocalReqId,
        data: &[u8],
    ) -> Result<Option<FinishedRecord>> {
        let (key, idx) = self
            .elements
            .remove(&req)
            .ok_or(RmcError::UnknownLocalRequest(req))?;
        let record = self
            .records
            .get_mut(&key)
            .ok_or(RmcError::UnknownLocalRequest(req))?;

        let size = record.req.size as usize;
        let start = idx as usize * size;
        let n = data.len().min(size);
        record.buffer[start..start + n].copy_from_slice(&data[..n]);
        record.completed += 1;

        if record.completed < record.req.nelem {
            return Ok(None);
        }
        Ok(self
            .records
            .remove(&key)
            .map(|r| FinishedRecord { req: r.req, buffer: r.buffer }))
    }

    /// Number of open records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bulk(key: TrackKey, nelem: u32) -> TrackedRequest {
        TrackedRequest {
            key,
            kind: OpKind::BulkRead,
            src_addr: 0x1000,
            dest_addr: 0x2000,
            size: 4,
            nelem,
            stride: 4,
            flags: Flags::empty(),
            aq: false,
            rl: false,
        }
    }

    #[test]
    fn finishes_only_on_last_element() {
        let mut t = LocalCompletionTracker::new();
        let key = TrackKey::Remote { src: 1, id: 10 };
        t.open(bulk(key, 4)).unwrap();
        let reqs: Vec<_> = (0..4).map(|i| t.issue_element(key, i)).collect();

        // Complete out of order; the buffer is still assembled by element index.
        for (n, &i) in [2usize, 0, 3].iter().enumerate() {
            let out = t.on_element_complete(reqs[i], &[i as u8; 4]).unwrap();
            assert!(out.is_none(), "finished after {} elements", n + 1);
        }
        let done = t.on_element_complete(reqs[1], &[1; 4]).unwrap().unwrap();
        assert_eq!(done.req.key, key);
        assert_eq!(done.buffer, vec![0, 0, 0, 0, 1, 1, 1, 1, 2, 2, 2, 2, 3, 3, 3, 3]);
        assert!(t.is_empty());
    }

    #[test]
    fn keys_from_different_sources_do_not_collide() {
        let mut t = LocalCompletionTracker::new();
        let a = TrackKey::Remote { src: 1, id: 5 };
        let b = TrackKey::Remote { src: 2, id: 5 };
        t.open(bulk(a, 1)).unwrap();
        t.open(bulk(b, 1)).unwrap();
        let rb = t.issue_element(b, 0);
        let done = t.on_element_complete(rb, &[9; 4]).unwrap().unwrap();
        assert_eq!(done.req.key, b);
        assert_eq!(t.len(), 1);
        let ra = t.issue_element(a, 0);
        assert_eq!(t.on_element_complete(ra, &[7; 4]).unwrap().unwrap().req.key, a);
    }

    #[test]
    fn duplicate_record_is_rejected() {
        let mut t = LocalCompletionTracker::new();
        let key = TrackKey::Gather { seq: 0 };
        t.open(bulk(key, 2)).unwrap();
        assert!(matches!(t.open(bulk(key, 2)), Err(RmcError::DuplicateRecord(_))));
    }

    #[test]
    fn unknown_or_repeated_completion_is_fatal() {
        let mut t = LocalCompletionTracker::new();
        let key = TrackKey::Remote { src: 0, id: 0 };
        t.open(bulk(key, 2)).unwrap();
        let r = t.issue_element(key, 0);
        assert!(t.on_element_complete(r, &[0; 4]).unwrap().is_none());
        assert!(matches!(
            t.on_element_complete(r, &[0; 4]),
            Err(RmcError::UnknownLocalRequest(_))
        ));
        assert!(matches!(
            t.on_element_complete(99, &[0; 4]),
            Err(RmcError::UnknownLocalRequest(99))
        ));
    }
}
