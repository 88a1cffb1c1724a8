//! A hash-keyed string identifier broker.
//!
//! The `Broker` assigns a stable, small, non-negative integer `Value` to each distinct byte string it has ever been
//! shown, and permits cheap lookup in both directions: string to value, value to string. Values are dense,
//! monotonically increasing in insertion order, and never reused for the lifetime of a broker.
//!
//!
//! #   How to use?
//!
//! If you just want to get going, use the `new` method, and you'll get a default configured `Broker` which will be
//! quite fine: call `insert_str` to obtain values, `get_str` to query without interning, and `resolve` to recover
//! the bytes of a value.
//!
//!
//! #   Configuration options
//!
//! The `Broker` delegates two concerns to the embedder, through its type parameters:
//!
//! -   The hashing algorithm can be tuned via `with_hasher`; it defaults to a byte-oriented 32-bit Murmur variant.
//!     Any `BuildHasher` works, only the low 32 bits of the finished hash are used.
//! -   The reader-writer lock guarding the interned state is any `lock_api::RawRwLock`; it defaults to the
//!     `parking_lot` lock. Queries acquire it shared, insertions exclusive.
//!
//!
//! #   Limits
//!
//! The `Broker` has some hard limits, due to design constraints:
//!
//! -   It supports only circa 4 billion distinct strings, eg. 2**32, after which insertion reports exhaustion.
//! -   It never forgets a string: there is no removal, and memory is only reclaimed by dropping the whole broker.
//!
//!
//! #   Internals
//!
//! The interned state is a balanced binary search tree keyed by a masked 32-bit hash of the bytes, not by the bytes
//! themselves:
//!
//! -   Each tree node packs its AVL height into the low 6 bits of the stored hash, so key and height share a single
//!     32-bit word; the mask costs 6 bits of hash entropy.
//! -   Strings whose masked hashes collide share a node, and are told apart by a linear scan of the node's chain of
//!     records; a record stores one distinct string and its value.
//! -   Nodes are bump-allocated from fixed-capacity blocks which are never freed, nor compacted, before the broker
//!     is dropped. Node positions are therefore stable, and resolving a value back to its bytes simply walks every
//!     block, as there is no secondary index.
//!
//! Records are immutable once linked, which is what makes handing out `&[u8]` borrows of interned bytes sound for
//! as long as the broker lives.

//  Ensure unsafe operations are duly checked.
#![deny(unsafe_op_in_unsafe_fn)]
//  Ensure proper documentation.
#![deny(missing_docs)]

mod broker;
mod error;
mod hash;
mod tree;
mod value;

pub use broker::{Broker, Statistics};
pub use error::BrokerError;
pub use hash::{DefaultMurmurBuildHasher, MurmurBuildHasher, MurmurHasher};
pub use value::Value;
