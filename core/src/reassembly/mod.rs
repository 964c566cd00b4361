//! Fragment reassembly
//!
//! Incoming fragments are grouped into buckets keyed by source device,
//! message type, and a coarse 5-second time bucket. Chunks of one logical
//! message land in the same bucket because the sequencer emits them within
//! one dwell cycle; unrelated messages of the same type from the same
//! source separate once they are seconds apart. Buckets whose oldest
//! fragment outlives the fragment timeout are garbage-collected.

use std::collections::{BTreeMap, HashMap};

use crate::message::{Fragment, Message, MessageType};

/// Width of the reassembly time bucket
pub const TIME_BUCKET_MS: u64 = 5_000;

/// Groups fragments that belong to one in-flight logical message
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReassemblyKey {
    pub source: String,
    pub message_type: MessageType,
    pub time_bucket: u64,
}

impl ReassemblyKey {
    pub fn new(source: &str, message_type: MessageType, received_ms: u64) -> Self {
        Self {
            source: source.to_string(),
            message_type,
            time_bucket: received_ms / TIME_BUCKET_MS,
        }
    }
}

#[derive(Debug)]
struct Bucket {
    /// Capacity fixed by the first fragment seen
    total_parts: u8,
    fragments: BTreeMap<u8, Fragment>,
    oldest_ms: u64,
    /// Forward decision computed on the first fragment and applied to the
    /// completed whole, so later fragments cannot be scored differently.
    will_forward: bool,
}

/// A whole message produced by combining a full bucket
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedMessage {
    pub message: Message,
    pub will_forward: bool,
}

/// Buffers multi-part fragments until every part has arrived
#[derive(Debug)]
pub struct Reassembler {
    buckets: HashMap<ReassemblyKey, Bucket>,
    fragment_timeout_ms: u64,
}

impl Reassembler {
    pub fn new(fragment_timeout_ms: u64) -> Self {
        Self {
            buckets: HashMap::new(),
            fragment_timeout_ms,
        }
    }

    /// Deposit one fragment. Arrival order is arbitrary; a duplicate part
    /// number overwrites the earlier copy. Returns the combined message
    /// once parts `1..=totalParts` are all present.
    pub fn insert(
        &mut self,
        source: &str,
        fragment: Fragment,
        received_ms: u64,
        will_forward: bool,
    ) -> Option<CompletedMessage> {
        let key = self.resolve_key(source, fragment.message.message_type(), received_ms);
        let bucket = self.buckets.entry(key.clone()).or_insert_with(|| Bucket {
            total_parts: fragment.total_parts,
            fragments: BTreeMap::new(),
            oldest_ms: received_ms,
            will_forward,
        });

        if fragment.part_no > bucket.total_parts {
            tracing::debug!(
                source,
                part_no = fragment.part_no,
                total_parts = bucket.total_parts,
                "fragment outside bucket capacity dropped"
            );
            return None;
        }
        bucket.fragments.insert(fragment.part_no, fragment);

        if bucket.fragments.len() == bucket.total_parts as usize {
            let bucket = self.buckets.remove(&key)?;
            let will_forward = bucket.will_forward;
            let message = combine(bucket)?;
            tracing::debug!(source, "reassembled multi-part message");
            return Some(CompletedMessage {
                message,
                will_forward,
            });
        }
        None
    }

    /// Chunks of one message can straddle a bucket boundary when the dwell
    /// cycle crosses a 5-second edge. If the exact bucket does not exist
    /// yet, join the previous one — but only while its oldest fragment is
    /// under one bucket-width old, so sends seconds apart still separate.
    fn resolve_key(
        &self,
        source: &str,
        message_type: MessageType,
        received_ms: u64,
    ) -> ReassemblyKey {
        let key = ReassemblyKey::new(source, message_type, received_ms);
        if self.buckets.contains_key(&key) || key.time_bucket == 0 {
            return key;
        }
        let previous = ReassemblyKey {
            time_bucket: key.time_bucket - 1,
            ..key.clone()
        };
        match self.buckets.get(&previous) {
            Some(bucket) if received_ms.saturating_sub(bucket.oldest_ms) < TIME_BUCKET_MS => {
                previous
            }
            _ => key,
        }
    }

    /// Drop buckets whose oldest fragment is older than the fragment
    /// timeout. Returns the number of buckets discarded.
    pub fn gc(&mut self, now_ms: u64) -> usize {
        let timeout = self.fragment_timeout_ms;
        let before = self.buckets.len();
        self.buckets
            .retain(|_, bucket| now_ms.saturating_sub(bucket.oldest_ms) <= timeout);
        let dropped = before - self.buckets.len();
        if dropped > 0 {
            tracing::debug!(dropped, "expired reassembly buckets discarded");
        }
        dropped
    }

    pub fn pending(&self) -> usize {
        self.buckets.len()
    }
}

/// Combine a full bucket in part-number order. Text segments concatenate;
/// the flight id comes from the first fragment; repeat and priority come
/// from the first fragment as well.
fn combine(bucket: Bucket) -> Option<Message> {
    let mut parts = bucket.fragments.into_values();
    let first = parts.next()?;
    let mut combined = first.message;
    for part in parts {
        match (&mut combined, part.message) {
            (
                Message::GeneralBasic { content, .. },
                Message::GeneralBasic {
                    content: segment, ..
                },
            ) => content.extend_from_slice(&segment),
            (Message::GeneralText { text, .. }, Message::GeneralText { text: segment, .. }) => {
                text.push_str(&segment)
            }
            (
                Message::FlightUpdateGeneral { text, .. },
                Message::FlightUpdateGeneral { text: segment, .. },
            ) => text.push_str(&segment),
            // Keyed by message type, so mixed buckets cannot happen; a
            // single-packet type simply keeps its first fragment.
            _ => {}
        }
    }
    Some(combined)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{split, Priority};

    fn fragments_of(message: &Message) -> Vec<Fragment> {
        split(message).unwrap()
    }

    #[test]
    fn test_single_fragment_completes_immediately() {
        let mut reassembler = Reassembler::new(60_000);
        let msg = Message::text("short", false, Priority::Medium);
        let completed = reassembler
            .insert("gate-7", Fragment::single(msg.clone()), 1_000, false)
            .unwrap();
        assert_eq!(completed.message, msg);
        assert_eq!(reassembler.pending(), 0);
    }

    #[test]
    fn test_multi_part_combines_in_order() {
        let mut reassembler = Reassembler::new(60_000);
        let msg = Message::text("A".repeat(50), false, Priority::Medium);
        let mut completed = None;
        for fragment in fragments_of(&msg) {
            completed = reassembler.insert("gate-7", fragment, 1_000, false);
        }
        assert_eq!(completed.unwrap().message, msg);
    }

    #[test]
    fn test_out_of_order_arrival() {
        let mut reassembler = Reassembler::new(60_000);
        let msg = Message::text("B".repeat(60), false, Priority::Medium);
        let mut fragments = fragments_of(&msg);
        fragments.reverse();
        let mut completed = None;
        for fragment in fragments {
            completed = reassembler.insert("gate-7", fragment, 1_000, false);
        }
        assert_eq!(completed.unwrap().message, msg);
    }

    #[test]
    fn test_flight_text_keeps_flight_id() {
        let mut reassembler = Reassembler::new(60_000);
        let msg = Message::flight_text("FL55", "z".repeat(40), false, Priority::High);
        let mut completed = None;
        for fragment in fragments_of(&msg) {
            completed = reassembler.insert("desk-2", fragment, 2_500, false);
        }
        assert_eq!(completed.unwrap().message, msg);
    }

    #[test]
    fn test_forward_decision_taken_from_first_fragment() {
        let mut reassembler = Reassembler::new(60_000);
        let msg = Message::text("C".repeat(30), false, Priority::Medium);
        let fragments = fragments_of(&msg);
        assert!(reassembler
            .insert("gate-7", fragments[0].clone(), 1_000, true)
            .is_none());
        // Later fragments carry a different decision; the bucket's wins.
        let completed = reassembler
            .insert("gate-7", fragments[1].clone(), 1_200, false)
            .unwrap();
        assert!(completed.will_forward);
    }

    #[test]
    fn test_duplicate_part_overwrites() {
        let mut reassembler = Reassembler::new(60_000);
        let msg = Message::text("D".repeat(30), false, Priority::Medium);
        let fragments = fragments_of(&msg);
        assert!(reassembler
            .insert("gate-7", fragments[0].clone(), 1_000, false)
            .is_none());
        assert!(reassembler
            .insert("gate-7", fragments[0].clone(), 1_100, false)
            .is_none());
        let completed = reassembler
            .insert("gate-7", fragments[1].clone(), 1_200, false)
            .unwrap();
        assert_eq!(completed.message, msg);
    }

    #[test]
    fn test_sources_do_not_share_buckets() {
        let mut reassembler = Reassembler::new(60_000);
        let msg = Message::text("E".repeat(30), false, Priority::Medium);
        let fragments = fragments_of(&msg);
        assert!(reassembler
            .insert("gate-7", fragments[0].clone(), 1_000, false)
            .is_none());
        assert!(reassembler
            .insert("gate-8", fragments[1].clone(), 1_000, false)
            .is_none());
        assert_eq!(reassembler.pending(), 2);
    }

    #[test]
    fn test_late_fragments_start_a_new_bucket() {
        let mut reassembler = Reassembler::new(60_000);
        let msg = Message::text("F".repeat(50), false, Priority::Medium);
        let fragments = fragments_of(&msg);
        assert_eq!(fragments.len(), 3);

        assert!(reassembler
            .insert("gate-7", fragments[0].clone(), 0, false)
            .is_none());

        // 61 seconds of silence: the bucket expires and the remaining
        // fragments key into a fresh bucket that can never complete.
        assert_eq!(reassembler.gc(61_000), 1);
        assert!(reassembler
            .insert("gate-7", fragments[1].clone(), 61_000, false)
            .is_none());
        assert!(reassembler
            .insert("gate-7", fragments[2].clone(), 61_100, false)
            .is_none());
        assert_eq!(reassembler.pending(), 1);
    }

    #[test]
    fn test_chunks_straddling_bucket_boundary_still_combine() {
        let mut reassembler = Reassembler::new(60_000);
        let msg = Message::text("I".repeat(30), false, Priority::Medium);
        let fragments = fragments_of(&msg);
        // Part 1 just before the 5-second edge, part 2 just after
        assert!(reassembler
            .insert("gate-7", fragments[0].clone(), 4_950, false)
            .is_none());
        let completed = reassembler
            .insert("gate-7", fragments[1].clone(), 5_050, false)
            .unwrap();
        assert_eq!(completed.message, msg);
    }

    #[test]
    fn test_sends_seconds_apart_do_not_join() {
        let mut reassembler = Reassembler::new(60_000);
        let msg = Message::text("J".repeat(30), false, Priority::Medium);
        let fragments = fragments_of(&msg);
        assert!(reassembler
            .insert("gate-7", fragments[0].clone(), 1_000, false)
            .is_none());
        // A fragment six seconds later belongs to a different send even
        // though its bucket is adjacent
        assert!(reassembler
            .insert("gate-7", fragments[1].clone(), 7_000, false)
            .is_none());
        assert_eq!(reassembler.pending(), 2);
    }

    #[test]
    fn test_gc_keeps_fresh_buckets() {
        let mut reassembler = Reassembler::new(60_000);
        let msg = Message::text("G".repeat(30), false, Priority::Medium);
        let fragments = fragments_of(&msg);
        reassembler.insert("gate-7", fragments[0].clone(), 10_000, false);
        assert_eq!(reassembler.gc(30_000), 0);
        assert_eq!(reassembler.pending(), 1);
        assert_eq!(reassembler.gc(80_000), 1);
        assert_eq!(reassembler.pending(), 0);
    }

    #[test]
    fn test_fragment_beyond_capacity_dropped() {
        let mut reassembler = Reassembler::new(60_000);
        let two_part = fragments_of(&Message::text("H".repeat(30), false, Priority::Medium));
        let three_part = fragments_of(&Message::text("H".repeat(50), false, Priority::Medium));
        assert!(reassembler
            .insert("gate-7", two_part[0].clone(), 1_000, false)
            .is_none());
        // Part 3 of an unrelated send cannot fit the two-part bucket
        assert!(reassembler
            .insert("gate-7", three_part[2].clone(), 1_200, false)
            .is_none());
        let completed = reassembler
            .insert("gate-7", two_part[1].clone(), 1_400, false)
            .unwrap();
        assert_eq!(completed.message.message_type(), MessageType::GeneralText);
    }
}
