//  The unsynchronized core of the broker: a hash-keyed AVL tree, its node pool, and the record chains.
//
//  The tree is keyed by a masked 32-bit hash, NOT by the bytes themselves; strings whose masked hashes collide share
//  a single node and are told apart by a linear scan of the node's record chain. The mask clears the low 6 bits of
//  the hash, which instead store the AVL height of the node, packing key and height in a single 32-bit word.
//
//  Nodes are bump-allocated from fixed-capacity blocks and never freed nor moved until the tree is dropped, so a
//  `NodeIndex` remains valid for the lifetime of the tree, and walking the blocks enumerates every live node.

use core::{cmp, mem};

use smallvec::SmallVec;
use static_assertions::const_assert;

use crate::{broker::Counters, error::BrokerError, value::Value};

/// Mask of the bits of `Node::flags` holding the masked hash.
pub(crate) const NODE_HASH_MASK: u32 = 0xffff_ffc0;

/// Mask of the bits of `Node::flags` holding the AVL height.
pub(crate) const NODE_HEIGHT_MASK: u32 = 0x3f;

//  Number of nodes per pool block.
const NODE_POOL_CAPACITY: usize = 16;

//  Upper bound on the height of an AVL tree keyed by 32 bits: ceil(1.45 * key bits) covers the worst case with room
//  to spare, since the mask leaves only 26 effective key bits.
const NODE_MAX_LEVEL: usize = (u32::BITS as usize) * 145 / 100 + 1;

//  The height must fit in the 6 bits reserved by `NODE_HEIGHT_MASK`.
const_assert!(NODE_MAX_LEVEL <= NODE_HEIGHT_MASK as usize);

/// The unsynchronized core. All mutation happens behind the broker's write lock.
pub(crate) struct Tree {
    root: Option<NodeIndex>,
    blocks: Vec<Box<Block>>,
    next_value: u32,
}

impl Tree {
    /// Creates an empty tree; the first fresh value will be 1.
    pub(crate) fn new() -> Self {
        Self {
            root: None,
            blocks: Vec::new(),
            next_value: Value::EMPTY.get() + 1,
        }
    }

    /// Returns the value of the record whose bytes match exactly, if any.
    ///
    /// `hash` must be masked by `NODE_HASH_MASK`; the caller computes it outside the lock.
    pub(crate) fn lookup(&self, bytes: &[u8], hash: u32) -> Option<Value> {
        debug_assert!(!bytes.is_empty());
        debug_assert_eq!(0, hash & NODE_HEIGHT_MASK);

        let mut cursor = self.root;

        while let Some(index) = cursor {
            let stored = self.stored_hash(index);

            if hash == stored {
                return self.scan_chain(index, bytes);
            }

            cursor = if hash < stored {
                self.node(index).left
            } else {
                self.node(index).right
            };
        }

        None
    }

    /// Returns the value of the record whose bytes match exactly, interning the bytes first if necessary.
    ///
    /// `hash` must be masked by `NODE_HASH_MASK`.
    ///
    /// On error the observable state is unchanged: no record is created, no value is consumed, and no existing
    /// lookup result is affected.
    pub(crate) fn insert(&mut self, bytes: &[u8], hash: u32, counters: &Counters) -> Result<Value, BrokerError> {
        debug_assert!(!bytes.is_empty());
        debug_assert_eq!(0, hash & NODE_HEIGHT_MASK);

        let mut stack: SmallVec<[NodeIndex; NODE_MAX_LEVEL]> = SmallVec::new();
        let mut cursor = self.root;
        let mut created = false;

        let target = loop {
            let Some(index) = cursor else {
                let index = self.allocate_node(hash, counters);

                stack.push(index);
                created = true;

                break index;
            };

            let stored = self.stored_hash(index);

            if hash == stored {
                break index;
            }

            stack.push(index);

            cursor = if hash < stored {
                self.node(index).left
            } else {
                self.node(index).right
            };
        };

        //  Only a fresh node can unbalance the tree; a matched hash leaves every height untouched.
        if created {
            while let Some(index) = stack.pop() {
                let index = self.rebalance(index);

                if let Some(&parent) = stack.last() {
                    if self.stored_hash(index) < self.stored_hash(parent) {
                        self.node_mut(parent).left = Some(index);
                    } else {
                        self.node_mut(parent).right = Some(index);
                    }
                } else {
                    self.root = Some(index);
                }
            }
        }

        //  Rotations rearrange links, never node contents, so `target` still designates the node owning the chain
        //  for `hash`.
        if let Some(value) = self.scan_chain(target, bytes) {
            return Ok(value);
        }

        let value = Value::new(self.next_value);

        let next_value = self
            .next_value
            .checked_add(1)
            .ok_or(BrokerError::ValuePoolExhausted)?;

        let record = Box::new(Record {
            next: self.node_mut(target).record.take(),
            value,
            bytes: Box::from(bytes),
        });

        counters.add_record(mem::size_of::<Record>() + bytes.len());

        self.node_mut(target).record = Some(record);
        self.next_value = next_value;

        Ok(value)
    }

    /// Returns the bytes of the record carrying `value`, if any.
    ///
    /// There is no per-value index: every chain of every live node is scanned, in O(total records).
    pub(crate) fn resolve(&self, value: Value) -> Option<&[u8]> {
        debug_assert_ne!(Value::EMPTY, value);

        for block in &self.blocks {
            for node in &block.nodes[..block.count] {
                let mut record = node.record.as_deref();

                while let Some(r) = record {
                    if value == r.value {
                        return Some(&r.bytes);
                    }

                    record = r.next.as_deref();
                }
            }
        }

        None
    }
}

//
//  Implementation
//

//  Index of a node within the pool: block `index / NODE_POOL_CAPACITY`, slot `index % NODE_POOL_CAPACITY`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct NodeIndex(u32);

//  A tree node. Owns one collision chain; `flags` packs the masked hash with the subtree height.
struct Node {
    left: Option<NodeIndex>,
    right: Option<NodeIndex>,
    record: Option<Box<Record>>,
    flags: u32,
}

impl Node {
    fn vacant() -> Self {
        Self {
            left: None,
            right: None,
            record: None,
            flags: 0,
        }
    }

    fn fresh(hash: u32) -> Self {
        debug_assert_eq!(0, hash & NODE_HEIGHT_MASK);

        Self {
            left: None,
            right: None,
            record: None,
            flags: hash,
        }
    }
}

//  A fixed-capacity container of nodes. Boxed, so growing the block vector never moves a node.
struct Block {
    nodes: [Node; NODE_POOL_CAPACITY],
    count: usize,
}

impl Block {
    fn allocate() -> Box<Self> {
        Box::new(Self {
            nodes: core::array::from_fn(|_| Node::vacant()),
            count: 0,
        })
    }
}

//  The stored copy of one distinct string. Immutable once linked into a chain.
struct Record {
    next: Option<Box<Record>>,
    value: Value,
    bytes: Box<[u8]>,
}

impl Tree {
    fn node(&self, index: NodeIndex) -> &Node {
        let index = index.0 as usize;

        &self.blocks[index / NODE_POOL_CAPACITY].nodes[index % NODE_POOL_CAPACITY]
    }

    fn node_mut(&mut self, index: NodeIndex) -> &mut Node {
        let index = index.0 as usize;

        &mut self.blocks[index / NODE_POOL_CAPACITY].nodes[index % NODE_POOL_CAPACITY]
    }

    //  Bump-allocates a node, appending a fresh block if the current one is full.
    fn allocate_node(&mut self, hash: u32, counters: &Counters) -> NodeIndex {
        if self.blocks.last().map_or(true, |block| block.count == NODE_POOL_CAPACITY) {
            self.blocks.push(Block::allocate());

            counters.add_block(mem::size_of::<Block>());
        }

        let block_index = self.blocks.len() - 1;
        let block = &mut self.blocks[block_index];

        let slot = block.count;

        block.count += 1;
        block.nodes[slot] = Node::fresh(hash);

        counters.add_node();

        NodeIndex((block_index * NODE_POOL_CAPACITY + slot) as u32)
    }

    //  Walks the chain of `index` for a byte-exact match. Most recently inserted records come first.
    fn scan_chain(&self, index: NodeIndex, bytes: &[u8]) -> Option<Value> {
        let mut record = self.node(index).record.as_deref();

        while let Some(r) = record {
            if *r.bytes == *bytes {
                return Some(r.value);
            }

            record = r.next.as_deref();
        }

        None
    }

    //  A missing child has height -1, a leaf height 0.
    fn height(&self, index: Option<NodeIndex>) -> i32 {
        index.map_or(-1, |index| (self.node(index).flags & NODE_HEIGHT_MASK) as i32)
    }

    fn stored_hash(&self, index: NodeIndex) -> u32 {
        self.node(index).flags & NODE_HASH_MASK
    }

    fn balance_factor(&self, index: NodeIndex) -> i32 {
        let node = self.node(index);

        self.height(node.right) - self.height(node.left)
    }

    //  Reconstructs `flags` from the stored hash and the children's heights.
    fn fix_height(&mut self, index: NodeIndex) {
        let (left, right) = {
            let node = self.node(index);

            (node.left, node.right)
        };

        let height = cmp::max(self.height(left), self.height(right)) + 1;

        debug_assert!(height <= NODE_MAX_LEVEL as i32);

        let node = self.node_mut(index);

        node.flags = (node.flags & NODE_HASH_MASK) | height as u32;
    }

    //  Promotes the left child, handing its former right subtree to the demoted node. Returns the new subtree root.
    fn rotate_right(&mut self, index: NodeIndex) -> NodeIndex {
        let Some(other) = self.node(index).left else {
            return index;
        };

        let other_right = self.node(other).right;

        self.node_mut(index).left = other_right;
        self.node_mut(other).right = Some(index);

        self.fix_height(index);
        self.fix_height(other);

        other
    }

    fn rotate_left(&mut self, index: NodeIndex) -> NodeIndex {
        let Some(other) = self.node(index).right else {
            return index;
        };

        let other_left = self.node(other).left;

        self.node_mut(index).right = other_left;
        self.node_mut(other).left = Some(index);

        self.fix_height(index);
        self.fix_height(other);

        other
    }

    //  Restores the AVL invariant at `index` after an insertion below it. Returns the (possibly replaced) subtree
    //  root, which the caller re-attaches to the parent.
    fn rebalance(&mut self, index: NodeIndex) -> NodeIndex {
        self.fix_height(index);

        match self.balance_factor(index) {
            2 => {
                //  A factor of +2 requires the right child to exist.
                let Some(right) = self.node(index).right else {
                    return index;
                };

                if self.balance_factor(right) < 0 {
                    let right = self.rotate_right(right);

                    self.node_mut(index).right = Some(right);
                }

                self.rotate_left(index)
            }
            -2 => {
                let Some(left) = self.node(index).left else {
                    return index;
                };

                if self.balance_factor(left) > 0 {
                    let left = self.rotate_left(left);

                    self.node_mut(index).left = Some(left);
                }

                self.rotate_right(index)
            }
            _ => index,
        }
    }
}

#[cfg(test)]
impl Tree {
    //  Asserts the AVL and ordering invariants over the whole tree, returning its height.
    pub(crate) fn check_invariants(&self) -> i32 {
        self.check_subtree(self.root, -1, i64::from(u32::MAX) + 1)
    }

    fn check_subtree(&self, index: Option<NodeIndex>, lower: i64, upper: i64) -> i32 {
        let Some(index) = index else {
            return -1;
        };

        let node = self.node(index);
        let hash = i64::from(node.flags & NODE_HASH_MASK);

        assert!(lower < hash && hash < upper, "hash order violated at {index:?}");

        let left = self.check_subtree(node.left, lower, hash);
        let right = self.check_subtree(node.right, hash, upper);

        assert!((left - right).abs() <= 1, "balance violated at {index:?}");

        let height = cmp::max(left, right) + 1;

        assert_eq!(height, (node.flags & NODE_HEIGHT_MASK) as i32, "stale height at {index:?}");

        height
    }
}
