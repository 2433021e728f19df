//! Recency list for the node cache.
//!
//! Index-linked doubly linked list: `fwd` points towards the head (more
//! recently used), `back` towards the tail. A uid map gives O(1) access to
//! any slot.

use crate::uid::FatUid;
use rustc_hash::FxHashMap;

struct Slot {
    uid: FatUid,
    fwd: Option<usize>,
    back: Option<usize>,
}

pub(crate) struct LruList {
    slots: Vec<Slot>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    index: FxHashMap<FatUid, usize>,
}

impl LruList {
    pub fn new() -> Self {
        LruList {
            slots: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
            index: FxHashMap::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Admits a uid at the MRU position. No-op if already present.
    pub fn push_front(&mut self, uid: FatUid) {
        if self.index.contains_key(&uid) {
            self.touch(&uid);
            return;
        }
        let slot = Slot {
            uid,
            fwd: None,
            back: self.head,
        };
        let idx = match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = slot;
                idx
            }
            None => {
                self.slots.push(slot);
                self.slots.len() - 1
            }
        };
        if let Some(head) = self.head {
            self.slots[head].fwd = Some(idx);
        } else {
            self.tail = Some(idx);
        }
        self.head = Some(idx);
        self.index.insert(uid, idx);
    }

    /// Moves a uid to the MRU position. Unknown uids are ignored; a stale
    /// promotion from the queue may arrive after its entry was evicted.
    pub fn touch(&mut self, uid: &FatUid) {
        let idx = match self.index.get(uid) {
            Some(&idx) => idx,
            None => return,
        };
        if self.head == Some(idx) {
            return;
        }
        self.unlink(idx);
        self.slots[idx].fwd = None;
        self.slots[idx].back = self.head;
        if let Some(head) = self.head {
            self.slots[head].fwd = Some(idx);
        } else {
            self.tail = Some(idx);
        }
        self.head = Some(idx);
    }

    pub fn remove(&mut self, uid: &FatUid) {
        if let Some(idx) = self.index.remove(uid) {
            self.unlink(idx);
            self.free.push(idx);
        }
    }

    /// Rewrites the uid of an entry in place, keeping its position.
    pub fn rename(&mut self, old: &FatUid, new: FatUid) {
        if let Some(idx) = self.index.remove(old) {
            self.slots[idx].uid = new;
            self.index.insert(new, idx);
        }
    }

    /// Uids from the LRU tail towards the head.
    pub fn tail_to_head(&self) -> Vec<FatUid> {
        let mut out = Vec::with_capacity(self.index.len());
        let mut cursor = self.tail;
        while let Some(idx) = cursor {
            out.push(self.slots[idx].uid);
            cursor = self.slots[idx].fwd;
        }
        out
    }

    fn unlink(&mut self, idx: usize) {
        let (fwd, back) = (self.slots[idx].fwd, self.slots[idx].back);
        match fwd {
            Some(f) => self.slots[f].back = back,
            None => self.head = back,
        }
        match back {
            Some(b) => self.slots[b].fwd = fwd,
            None => self.tail = fwd,
        }
        self.slots[idx].fwd = None;
        self.slots[idx].back = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uid(n: u64) -> FatUid {
        FatUid::volatile(n)
    }

    #[test]
    fn insert_and_order() {
        let mut lru = LruList::new();
        for n in 0..3 {
            lru.push_front(uid(n));
        }
        assert_eq!(lru.len(), 3);
        assert_eq!(lru.tail_to_head(), vec![uid(0), uid(1), uid(2)]);
    }

    #[test]
    fn touch_moves_to_front() {
        let mut lru = LruList::new();
        for n in 0..3 {
            lru.push_front(uid(n));
        }
        lru.touch(&uid(0));
        assert_eq!(lru.tail_to_head(), vec![uid(1), uid(2), uid(0)]);
        lru.touch(&uid(0));
        assert_eq!(lru.tail_to_head(), vec![uid(1), uid(2), uid(0)]);
    }

    #[test]
    fn remove_relinks() {
        let mut lru = LruList::new();
        for n in 0..3 {
            lru.push_front(uid(n));
        }
        lru.remove(&uid(1));
        assert_eq!(lru.tail_to_head(), vec![uid(0), uid(2)]);
        lru.remove(&uid(0));
        lru.remove(&uid(2));
        assert_eq!(lru.len(), 0);
        assert_eq!(lru.tail_to_head(), Vec::<FatUid>::new());
        // slots are recycled
        lru.push_front(uid(7));
        assert_eq!(lru.tail_to_head(), vec![uid(7)]);
    }

    #[test]
    fn rename_keeps_position() {
        let mut lru = LruList::new();
        for n in 0..3 {
            lru.push_front(uid(n));
        }
        lru.rename(&uid(1), FatUid::file(8, 8));
        assert_eq!(
            lru.tail_to_head(),
            vec![uid(0), FatUid::file(8, 8), uid(2)]
        );
    }
}
