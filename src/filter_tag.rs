//! A one-byte plausibility check for fragments: the high nibble identifies the sender, the low
//!  nibble the receiver the sender had in mind. A zero nibble is a wildcard.
//!
//! The check is deliberately permissive. Dropping legitimate fragments while a peer's address
//!  changes (e.g. NAT re-binding) is worse than letting an occasional bad fragment through, so a
//!  fragment is only rejected if *both* nibbles are known and *both* disagree with what the
//!  receiver observes.

pub const WILDCARD: u8 = 0;

pub fn make(src_id: u8, dst_id: u8) -> u8 {
    ((src_id & 0xF) << 4) | (dst_id & 0xF)
}

pub fn should_reject(tag: u8, observed_src: u8, observed_dst: u8) -> bool {
    let tag_src = tag >> 4;
    let tag_dst = tag & 0xF;

    if tag_src == WILDCARD || tag_dst == WILDCARD {
        return false;
    }

    let observed_src = observed_src & 0xF;
    let observed_dst = observed_dst & 0xF;
    if observed_src == WILDCARD || observed_dst == WILDCARD {
        return false;
    }

    tag_src != observed_src && tag_dst != observed_dst
}
