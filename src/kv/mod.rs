//! The optimistic-concurrency key/value store applied on top of the replicated log.
//!
//! Grounded on `kvraft1/server.go`'s `DoOp` type switch: a `Put` only succeeds when the
//! caller's `version` matches the stored entry's (or the key is absent and `version == 0`),
//! and every successful `Put` bumps the version by exactly one.

pub mod client;
pub mod server;

use crate::rsm::StateMachine;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum KvOp {
    Get { key: String },
    Put { key: String, value: String, version: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KvErr {
    Ok,
    NoKey,
    Version,
}

/// What `KvStateMachine::do_op` actually returns, bincode-encoded, as the result bytes
/// handed back through `Rsm::submit`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum KvReply {
    Get { value: String, version: u64, err: KvErr },
    Put { err: KvErr },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Entry {
    value: String,
    version: u64,
}

#[derive(Default)]
pub struct KvStateMachine {
    data: Mutex<HashMap<String, Entry>>,
}

impl KvStateMachine {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateMachine for KvStateMachine {
    fn do_op(&self, op: Vec<u8>) -> Vec<u8> {
        let op: KvOp = bincode::deserialize(&op).expect("committed op must decode");
        let mut data = self.data.lock().unwrap();
        let reply = match op {
            KvOp::Get { key } => match data.get(&key) {
                Some(e) => KvReply::Get { value: e.value.clone(), version: e.version, err: KvErr::Ok },
                None => KvReply::Get { value: String::new(), version: 0, err: KvErr::NoKey },
            },
            KvOp::Put { key, value, version } => {
                let err = match data.get(&key) {
                    None if version == 0 => {
                        data.insert(key, Entry { value, version: 1 });
                        KvErr::Ok
                    }
                    None => KvErr::NoKey,
                    Some(e) if e.version == version => {
                        let next_version = e.version + 1;
                        data.insert(key, Entry { value, version: next_version });
                        KvErr::Ok
                    }
                    Some(_) => KvErr::Version,
                };
                KvReply::Put { err }
            }
        };
        bincode::serialize(&reply).expect("kv reply must serialize")
    }

    fn snapshot(&self) -> Vec<u8> {
        bincode::serialize(&*self.data.lock().unwrap()).expect("kv table must serialize")
    }

    fn restore(&self, snapshot: Vec<u8>) {
        *self.data.lock().unwrap() =
            bincode::deserialize(&snapshot).expect("corrupt kv snapshot");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn do_op(sm: &KvStateMachine, op: KvOp) -> KvReply {
        let encoded = bincode::serialize(&op).unwrap();
        bincode::deserialize(&sm.do_op(encoded)).unwrap()
    }

    #[test]
    fn get_missing_key_is_no_key() {
        let sm = KvStateMachine::new();
        let result = do_op(&sm, KvOp::Get { key: "a".into() });
        assert!(matches!(result, KvReply::Get { err: KvErr::NoKey, .. }));
    }

    #[test]
    fn put_creates_key_only_at_version_zero() {
        let sm = KvStateMachine::new();
        let result = do_op(
            &sm,
            KvOp::Put { key: "a".into(), value: "1".into(), version: 1 },
        );
        assert!(matches!(result, KvReply::Put { err: KvErr::NoKey }));

        let result = do_op(
            &sm,
            KvOp::Put { key: "a".into(), value: "1".into(), version: 0 },
        );
        assert!(matches!(result, KvReply::Put { err: KvErr::Ok }));
    }

    #[test]
    fn put_requires_matching_version_and_advances_it() {
        let sm = KvStateMachine::new();
        do_op(&sm, KvOp::Put { key: "a".into(), value: "1".into(), version: 0 });

        let stale = do_op(
            &sm,
            KvOp::Put { key: "a".into(), value: "2".into(), version: 0 },
        );
        assert!(matches!(stale, KvReply::Put { err: KvErr::Version }));

        let ok = do_op(
            &sm,
            KvOp::Put { key: "a".into(), value: "2".into(), version: 1 },
        );
        assert!(matches!(ok, KvReply::Put { err: KvErr::Ok }));

        let get = do_op(&sm, KvOp::Get { key: "a".into() });
        assert!(matches!(get, KvReply::Get { ref value, version: 2, err: KvErr::Ok } if value == "2"));
    }

    #[test]
    fn snapshot_round_trips_the_table() {
        let sm = KvStateMachine::new();
        do_op(&sm, KvOp::Put { key: "a".into(), value: "1".into(), version: 0 });
        let snap = sm.snapshot();

        let restored = KvStateMachine::new();
        restored.restore(snap);
        let get = do_op(&restored, KvOp::Get { key: "a".into() });
        assert!(matches!(get, KvReply::Get { ref value, version: 1, err: KvErr::Ok } if value == "1"));
    }
}
