//! Fragmentation and reassembly of messages over an unreliable datagram transport.
//!
//! Application messages of arbitrary size (up to a configured maximum) are queued per
//!  destination and sent as datagrams of at most MTU payload bytes. Small messages can share a
//!  datagram, big messages are split into fragments, and the receiving side puts them back
//!  together. There are no acknowledgements, retransmits or ordering guarantees: a message is
//!  either delivered completely or not at all.
//!
//! ## Outbound
//!
//! * Each destination has its own queue with a number of priority levels. A message is either
//!    *coalescable*, i.e. it may be bundled with other messages into a single datagram or
//!    a sequence of fragments, or it is sent as a datagram of its own.
//!   * Non-coalescable messages take precedence over everything else, even over a bundle that
//!      is halfway sent
//!   * Coalesced messages arrive as a single buffer, so they must be self-delimiting
//!   * Messages with different hop limits never share a bundle
//! * A message may carry a 'replace key' that overwrites a message with the same key that is
//!    still queued
//! * Destinations are served round-robin, one datagram at a time. Each destination's send rate
//!    is limited based on what the peer reports about its receive rate
//!
//! ## Inbound
//!
//! * Fragments are collected per sender and message id until the message is complete. Partial
//!    messages are discarded after a timeout
//! * A one-byte filter tag in each fragment identifies sender and receiver, which gives a cheap
//!    plausibility check against fragments that were not meant for this node
//!
//! ## Datagram layout
//!
//! ```ascii
//! 0: fragment header (2 to 14 bytes, see [fragment_header])
//! *: payload: either an entire message (or bundle), or a slice of it at offset
//!     `fragment_index * MTU`
//! ```
//!
//! The MTU is the maximum payload size per datagram, *not* counting the fragment header. Both
//!  sides must agree on it.

pub mod buffer_pool;
pub mod config;
pub mod datagram_sink;
pub mod delegate;
pub mod end_point;
pub mod engine;
pub mod filter_tag;
pub mod fragment_header;
pub mod fragmenter;
pub mod rate_estimator;
pub mod reassembly;
pub mod safe_converter;
pub mod send_queue;

#[cfg(test)] mod test_util;
