// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! # Slab redo log
//!
//! The write set of the software algorithms: an unbalanced binary search
//! tree mapping 64-byte-aligned addresses to 64-byte slabs of buffered
//! bytes, with a per-slab bitmask recording which bytes are live.
//!
//! Nodes (children, key, mask) and slab payloads live in two flat pools
//! correlated by index, so a slab is exactly a cache line and clearing the
//! whole structure is two stores. The pools grow by doubling; because the
//! tree links are integer indices rather than pointers, growth never moves
//! a reachable entry.

use crate::types::{value_from_bytes, value_to_bytes, TmPrimitive};

/// Bytes covered by one slab.
pub const SLAB_SIZE: usize = 64;

const SLAB_OFFSET_MASK: usize = SLAB_SIZE - 1;
const KEY_MASK: usize = !SLAB_OFFSET_MASK;

/// Entries both pools start out with.
const INITIAL_SIZE: usize = 1024;

/// Index value meaning "no child".
const NIL: i32 = -1;

#[repr(align(64))]
#[derive(Clone, Copy)]
struct Slab {
    data: [u8; SLAB_SIZE],
}

impl Slab {
    const fn zeroed() -> Self {
        Self { data: [0; SLAB_SIZE] }
    }
}

#[derive(Clone, Copy)]
struct Node {
    left: i32,
    right: i32,
    key: usize,
    mask: u64,
}

impl Node {
    const fn empty() -> Self {
        Self {
            left: NIL,
            right: NIL,
            key: 0,
            mask: 0,
        }
    }

    /// A node handed out from the pool starts with no children and no live
    /// bytes.
    fn reinit(&mut self, key: usize) {
        self.left = NIL;
        self.right = NIL;
        self.key = key;
        self.mask = 0;
    }
}

pub struct RedoLog {
    nodes: Vec<Node>,
    slabs: Vec<Slab>,
    pool_next: usize,
    root: i32,
}

impl Default for RedoLog {
    fn default() -> Self {
        Self::new()
    }
}

impl RedoLog {
    pub fn new() -> Self {
        Self {
            nodes: vec![Node::empty(); INITIAL_SIZE],
            slabs: vec![Slab::zeroed(); INITIAL_SIZE],
            pool_next: 0,
            root: NIL,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.root == NIL
    }

    /// Invalidates the tree and recycles both pools. Capacity is retained;
    /// a transaction that grew the pools will likely be followed by another
    /// one that needs them just as large.
    pub fn reset(&mut self) {
        self.root = NIL;
        self.pool_next = 0;
    }

    /// True iff the next insertion of a fresh key will grow the pools.
    pub fn will_reorg(&self) -> bool {
        self.pool_next == self.nodes.len()
    }

    /// Number of populated slabs.
    pub fn slabcount(&self) -> usize {
        self.pool_next
    }

    /// Base address covered by slab `i`.
    pub fn get_key(&self, i: usize) -> usize {
        self.nodes[i].key
    }

    /// Live-byte mask of slab `i`.
    pub fn get_mask(&self, i: usize) -> u64 {
        self.nodes[i].mask
    }

    /// Walks the tree for `key` and returns the slab index holding it,
    /// allocating (and attaching) a fresh node when the key is new.
    fn reserve(&mut self, key: usize) -> usize {
        if self.is_empty() {
            let my_idx = self.pool_next;
            self.pool_next += 1;
            self.nodes[my_idx].reinit(key);
            self.root = my_idx as i32;
            return my_idx;
        }

        let mut curr = self.root;
        let mut parent = curr;
        while curr != NIL {
            parent = curr;
            let node = &self.nodes[curr as usize];
            if node.key == key {
                return curr as usize;
            }
            curr = if key < node.key { node.left } else { node.right };
        }

        if self.will_reorg() {
            let doubled = self.nodes.len() * 2;
            self.nodes.resize(doubled, Node::empty());
            self.slabs.resize(doubled, Slab::zeroed());
        }

        let new_node = self.pool_next;
        self.pool_next += 1;
        self.nodes[new_node].reinit(key);
        if key < self.nodes[parent as usize].key {
            self.nodes[parent as usize].left = new_node as i32;
        } else {
            self.nodes[parent as usize].right = new_node as i32;
        }
        new_node
    }

    /// Returns the slab index holding `key`, or `None`.
    fn lookup(&self, key: usize) -> Option<usize> {
        let mut curr = self.root;
        while curr != NIL {
            let node = &self.nodes[curr as usize];
            if node.key == key {
                return Some(curr as usize);
            }
            curr = if key < node.key { node.left } else { node.right };
        }
        None
    }

    /// Buffers `bytes` at `addr`. The datum must not cross a slab boundary;
    /// bulk callers iterate byte-by-byte instead.
    pub fn insert_bytes(&mut self, addr: usize, bytes: &[u8]) {
        let offset = addr & SLAB_OFFSET_MASK;
        debug_assert!(offset + bytes.len() <= SLAB_SIZE);

        let idx = self.reserve(addr & KEY_MASK);
        self.slabs[idx].data[offset..offset + bytes.len()].copy_from_slice(bytes);
        self.nodes[idx].mask |= live_bits(bytes.len()) << offset;
    }

    /// Copies the buffered bytes covering `[addr, addr + out.len())` into
    /// `out` and returns the live-bit mask for that range (low bit = first
    /// byte). A zero return means no byte of the range has been written.
    pub fn find_bytes(&self, addr: usize, out: &mut [u8]) -> u64 {
        let offset = addr & SLAB_OFFSET_MASK;
        debug_assert!(offset + out.len() <= SLAB_SIZE);

        let idx = match self.lookup(addr & KEY_MASK) {
            Some(idx) => idx,
            None => return 0,
        };

        let livebits = (self.nodes[idx].mask >> offset) & live_bits(out.len());
        if livebits == 0 {
            return 0;
        }

        out.copy_from_slice(&self.slabs[idx].data[offset..offset + out.len()]);
        livebits
    }

    /// True iff any byte of `[addr, addr + len)` is buffered.
    pub fn find_addr(&self, addr: usize, len: usize) -> bool {
        let offset = addr & SLAB_OFFSET_MASK;
        debug_assert!(offset + len <= SLAB_SIZE);

        match self.lookup(addr & KEY_MASK) {
            Some(idx) => (self.nodes[idx].mask >> offset) & live_bits(len) != 0,
            None => false,
        }
    }

    /// Copies the buffered bytes out like [`RedoLog::find_bytes`], then
    /// zeroes the payload bytes. The mask and the node stay in place.
    pub fn remove_bytes(&mut self, addr: usize, out: &mut [u8]) -> u64 {
        let offset = addr & SLAB_OFFSET_MASK;
        debug_assert!(offset + out.len() <= SLAB_SIZE);

        let idx = match self.lookup(addr & KEY_MASK) {
            Some(idx) => idx,
            None => return 0,
        };

        let livebits = (self.nodes[idx].mask >> offset) & live_bits(out.len());
        if livebits == 0 {
            return 0;
        }

        let payload = &mut self.slabs[idx].data[offset..offset + out.len()];
        out.copy_from_slice(payload);
        payload.fill(0);
        livebits
    }

    /// Typed insert; `val` must fit within one slab starting at `addr`.
    pub fn insert<V: TmPrimitive>(&mut self, addr: *const V, val: V) {
        let (bytes, len) = value_to_bytes(val);
        self.insert_bytes(addr as usize, &bytes[..len]);
    }

    /// Typed lookup. On a hit, `out` receives the buffered value and the
    /// live-bit mask for its bytes is returned; zero means miss.
    pub fn find<V: TmPrimitive>(&self, addr: *const V, out: &mut V) -> u64 {
        let mut bytes = [0u8; crate::types::MAX_VALUE_WIDTH];
        let len = core::mem::size_of::<V>();
        let livebits = self.find_bytes(addr as usize, &mut bytes[..len]);
        if livebits != 0 {
            *out = value_from_bytes(&bytes[..len]);
        }
        livebits
    }

    /// Typed removal used by operation logs; see [`RedoLog::remove_bytes`].
    pub fn remove<V: TmPrimitive>(&mut self, addr: *const V, out: &mut V) -> u64 {
        let mut bytes = [0u8; crate::types::MAX_VALUE_WIDTH];
        let len = core::mem::size_of::<V>();
        let livebits = self.remove_bytes(addr as usize, &mut bytes[..len]);
        if livebits != 0 {
            *out = value_from_bytes(&bytes[..len]);
        }
        livebits
    }

    /// Replays every live byte of every slab into memory. Four contiguous
    /// live bytes at a 4-aligned offset are stored as one 32-bit word.
    ///
    /// # Safety
    ///
    /// Every key in the log must point at memory that is valid for writes of
    /// the live bytes recorded for it, and the caller must hold whatever
    /// ownership the algorithm requires for those locations.
    pub unsafe fn writeback(&self) {
        for i in 0..self.pool_next {
            let node = &self.nodes[i];
            let slab = &self.slabs[i];
            for group in (0..SLAB_SIZE).step_by(4) {
                let mut m = ((node.mask >> group) & 0xF) as u32;
                if m == 0xF {
                    let addr = (node.key + group) as *mut u32;
                    let data = slab.data.as_ptr().add(group) as *const u32;
                    addr.write(data.read());
                } else if m != 0 {
                    let mut addr = (node.key + group) as *mut u8;
                    let mut data = slab.data.as_ptr().add(group);
                    for _ in 0..4 {
                        if m & 1 != 0 {
                            addr.write(data.read());
                        }
                        addr = addr.add(1);
                        data = data.add(1);
                        m >>= 1;
                    }
                }
            }
        }
    }
}

/// Low `len` bits set; the mask contribution of a `len`-byte datum.
fn live_bits(len: usize) -> u64 {
    debug_assert!(len <= SLAB_SIZE);
    if len == SLAB_SIZE {
        u64::MAX
    } else {
        (1u64 << len) - 1
    }
}
