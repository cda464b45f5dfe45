//! In-memory storage for tests, behind the crate's [`KVStore`] contract.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use keyframe_bft::chain::{KVGet, KVStore, WriteBatch};

/// Cloneable handle to one node's in-memory chain storage. All clones share the same map, so the
/// harness can read a node's chain through a [`ChainViewCamera`] clone while the node's pacemaker
/// owns the writing handle.
///
/// [`ChainViewCamera`]: keyframe_bft::chain::ChainViewCamera
#[derive(Clone, Default)]
pub struct SharedStore {
    map: Arc<Mutex<BTreeMap<Vec<u8>, Vec<u8>>>>,
}

impl SharedStore {
    /// Create a new, empty store.
    pub fn new() -> SharedStore {
        SharedStore::default()
    }
}

impl KVGet for SharedStore {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.map.lock().unwrap().get(key).cloned()
    }
}

impl KVStore for SharedStore {
    type WriteBatch = OpLog;
    type Snapshot<'a> = FrozenStore;

    fn write(&mut self, wb: OpLog) {
        let mut map = self.map.lock().unwrap();
        for op in wb.ops {
            match op {
                Op::Put(key, value) => {
                    map.insert(key, value);
                }
                Op::Delete(key) => {
                    map.remove(&key);
                }
            }
        }
    }

    fn clear(&mut self) {
        self.map.lock().unwrap().clear();
    }

    fn snapshot<'b>(&'b self) -> FrozenStore {
        FrozenStore(self.map.lock().unwrap().clone())
    }
}

/// A write batch kept as an ordered op log and replayed under a single lock acquisition. Replay
/// order makes later ops win for the same key, which is all the batch semantics the chain store
/// asks for.
#[derive(Default)]
pub struct OpLog {
    ops: Vec<Op>,
}

enum Op {
    Put(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
}

impl WriteBatch for OpLog {
    fn new() -> OpLog {
        OpLog::default()
    }

    fn set(&mut self, key: &[u8], value: &[u8]) {
        self.ops.push(Op::Put(key.to_vec(), value.to_vec()));
    }

    fn delete(&mut self, key: &[u8]) {
        self.ops.push(Op::Delete(key.to_vec()));
    }
}

/// A point-in-time copy of the map. Snapshots are detached copies rather than held locks, so a
/// test can keep a `ChainView` open on the same thread that keeps writing through the pacemaker.
pub struct FrozenStore(BTreeMap<Vec<u8>, Vec<u8>>);

impl KVGet for FrozenStore {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.0.get(key).cloned()
    }
}
