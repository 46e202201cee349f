//! Deferred, deduplicated word writes into shared GPU buffers.
//!
//! Fixups for different pages are generated independently within one cycle
//! and may touch the same 32-bit word several times. Applying them as they
//! are produced would make the final contents depend on generation order, so
//! updates are accumulated here and collapsed per offset before a single
//! batched write pass. Collapsing composes the ops exactly as serial
//! application in submission order would, so the flushed batch carries at
//! most two updates per word (an And/Or mask pair) and usually one.

use rustc_hash::FxHashMap;

/// Word-level update operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScatterOp {
    Or,
    And,
    Write,
}

/// One deferred 32-bit write at a byte offset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScatterUpdate {
    pub op: ScatterOp,
    pub offset: u64,
    pub value: u32,
}

impl ScatterUpdate {
    /// Apply this update to a word value
    pub fn apply(&self, word: u32) -> u32 {
        match self.op {
            ScatterOp::Or => word | self.value,
            ScatterOp::And => word & self.value,
            ScatterOp::Write => self.value,
        }
    }
}

/// Serial composition of every update seen at one offset.
///
/// `Based` means a `Write` has pinned the value; `Masked` is the general
/// `(word & and_mask) | or_mask` form that `Or`/`And` sequences reduce to.
#[derive(Debug, Clone, Copy)]
enum Composed {
    Based(u32),
    Masked { and_mask: u32, or_mask: u32 },
}

impl Composed {
    fn seed(update: ScatterUpdate) -> Composed {
        match update.op {
            ScatterOp::Write => Composed::Based(update.value),
            ScatterOp::Or => Composed::Masked {
                and_mask: u32::MAX,
                or_mask: update.value,
            },
            ScatterOp::And => Composed::Masked {
                and_mask: update.value,
                or_mask: 0,
            },
        }
    }

    fn fold(self, update: ScatterUpdate) -> Composed {
        match (self, update.op) {
            (_, ScatterOp::Write) => Composed::Based(update.value),
            (Composed::Based(base), _) => Composed::Based(update.apply(base)),
            (Composed::Masked { and_mask, or_mask }, ScatterOp::Or) => Composed::Masked {
                and_mask,
                or_mask: or_mask | update.value,
            },
            (Composed::Masked { and_mask, or_mask }, ScatterOp::And) => Composed::Masked {
                and_mask: and_mask & update.value,
                or_mask: or_mask & update.value,
            },
        }
    }

    /// Bits whose final value no longer depends on the previous word contents
    fn forced_mask(self) -> u32 {
        match self {
            Composed::Based(_) => u32::MAX,
            Composed::Masked { and_mask, or_mask } => !and_mask | or_mask,
        }
    }
}

/// Accumulates scatter updates for one target buffer
#[derive(Default)]
pub struct ScatterBatcher {
    updates: Vec<ScatterUpdate>,
    resolved: Vec<ScatterUpdate>,
    total_submitted: u64,
}

impl ScatterBatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue one update; nothing is applied until flush
    pub fn push(&mut self, op: ScatterOp, offset: u64, value: u32) {
        debug_assert_eq!(offset % 4, 0, "scatter offset {} not word aligned", offset);
        self.updates.push(ScatterUpdate { op, offset, value });
        self.total_submitted += 1;
    }

    /// Collapse queued updates to the minimal per-offset equivalent.
    ///
    /// Walks submission order, so the surviving update for each word is
    /// exactly what serial application would have produced. The debug check
    /// confirms composition only ever widens the set of bits the final value
    /// forces, i.e. dropping the shadowed partial writes was safe.
    pub fn resolve_overwrites(&mut self) {
        if self.updates.is_empty() {
            return;
        }
        let mut table: FxHashMap<u64, Composed> =
            FxHashMap::with_capacity_and_hasher(self.updates.len(), Default::default());

        // Earlier resolved-but-unflushed updates come first in serial order.
        for update in self.resolved.drain(..).chain(self.updates.drain(..)) {
            let composed = match table.get(&update.offset) {
                Some(&previous) => {
                    let next = previous.fold(update);
                    debug_assert_eq!(
                        next.forced_mask() & previous.forced_mask(),
                        previous.forced_mask(),
                        "composition dropped forced bits at offset {}",
                        update.offset
                    );
                    next
                }
                None => Composed::seed(update),
            };
            table.insert(update.offset, composed);
        }

        let mut offsets: Vec<u64> = table.keys().copied().collect();
        offsets.sort_unstable();
        for offset in offsets {
            match table[&offset] {
                Composed::Based(value) => self.resolved.push(ScatterUpdate {
                    op: ScatterOp::Write,
                    offset,
                    value,
                }),
                Composed::Masked { and_mask, or_mask } => {
                    if and_mask == u32::MAX && or_mask == 0 {
                        // Identity; the word is untouched.
                    } else if (and_mask | or_mask) == u32::MAX {
                        self.resolved.push(ScatterUpdate {
                            op: ScatterOp::Or,
                            offset,
                            value: or_mask,
                        });
                    } else if or_mask == 0 {
                        self.resolved.push(ScatterUpdate {
                            op: ScatterOp::And,
                            offset,
                            value: and_mask,
                        });
                    } else {
                        // Mixed clear+set on one word needs the pair, in order.
                        self.resolved.push(ScatterUpdate {
                            op: ScatterOp::And,
                            offset,
                            value: and_mask,
                        });
                        self.resolved.push(ScatterUpdate {
                            op: ScatterOp::Or,
                            offset,
                            value: or_mask,
                        });
                    }
                }
            }
        }
    }

    /// Resolve and hand back the batch for one write pass, clearing state
    pub fn flush(&mut self) -> Vec<ScatterUpdate> {
        self.resolve_overwrites();
        std::mem::take(&mut self.resolved)
    }

    pub fn is_empty(&self) -> bool {
        self.updates.is_empty() && self.resolved.is_empty()
    }

    pub fn pending_len(&self) -> usize {
        self.updates.len() + self.resolved.len()
    }

    pub fn total_submitted(&self) -> u64 {
        self.total_submitted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn apply_all(updates: &[ScatterUpdate], mut word: u32) -> u32 {
        for update in updates {
            word = update.apply(word);
        }
        word
    }

    #[test]
    fn test_write_then_or_composes_to_seven() {
        let mut batcher = ScatterBatcher::new();
        batcher.push(ScatterOp::Write, 0, 5);
        batcher.push(ScatterOp::Or, 0, 2);
        let batch = batcher.flush();
        assert_eq!(
            batch,
            vec![ScatterUpdate {
                op: ScatterOp::Write,
                offset: 0,
                value: 7
            }]
        );
    }

    #[test]
    fn test_last_write_wins() {
        let mut batcher = ScatterBatcher::new();
        batcher.push(ScatterOp::Write, 0, 5);
        batcher.push(ScatterOp::Write, 0, 9);
        let batch = batcher.flush();
        assert_eq!(
            batch,
            vec![ScatterUpdate {
                op: ScatterOp::Write,
                offset: 0,
                value: 9
            }]
        );
    }

    #[test]
    fn test_write_shadows_earlier_masks() {
        let mut batcher = ScatterBatcher::new();
        batcher.push(ScatterOp::Or, 0, 2);
        batcher.push(ScatterOp::Write, 0, 5);
        let batch = batcher.flush();
        assert_eq!(apply_all(&batch, 0xFFFF_0000), 5);
    }

    #[test]
    fn test_pure_masks_stay_masks() {
        let mut batcher = ScatterBatcher::new();
        batcher.push(ScatterOp::Or, 4, 0x8000_0000);
        let batch = batcher.flush();
        assert_eq!(
            batch,
            vec![ScatterUpdate {
                op: ScatterOp::Or,
                offset: 4,
                value: 0x8000_0000
            }]
        );

        let mut batcher = ScatterBatcher::new();
        batcher.push(ScatterOp::And, 4, !0x8000_0000);
        batcher.push(ScatterOp::And, 4, !0x1);
        let batch = batcher.flush();
        assert_eq!(
            batch,
            vec![ScatterUpdate {
                op: ScatterOp::And,
                offset: 4,
                value: !0x8000_0001
            }]
        );
    }

    #[test]
    fn test_mixed_clear_and_set_emits_pair() {
        let mut batcher = ScatterBatcher::new();
        batcher.push(ScatterOp::And, 0, !0x2);
        batcher.push(ScatterOp::Or, 0, 0x1);
        let batch = batcher.flush();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].op, ScatterOp::And);
        assert_eq!(batch[1].op, ScatterOp::Or);
        // Serial equivalence on a sample word.
        assert_eq!(apply_all(&batch, 0b0110), (0b0110 & !0x2) | 0x1);
    }

    #[test]
    fn test_identity_updates_are_dropped() {
        let mut batcher = ScatterBatcher::new();
        batcher.push(ScatterOp::Or, 0, 0);
        batcher.push(ScatterOp::And, 8, u32::MAX);
        assert!(batcher.flush().is_empty());
    }

    #[test]
    fn test_offsets_sorted_and_independent() {
        let mut batcher = ScatterBatcher::new();
        batcher.push(ScatterOp::Write, 8, 1);
        batcher.push(ScatterOp::Write, 0, 2);
        batcher.push(ScatterOp::Or, 8, 4);
        let batch = batcher.flush();
        assert_eq!(batch.len(), 2);
        assert_eq!((batch[0].offset, batch[0].value), (0, 2));
        assert_eq!((batch[1].offset, batch[1].value), (8, 5));
    }

    #[test]
    fn test_offsets_past_4gib_compose() {
        // Pool buffers can exceed the 32-bit byte range; dedup must key on
        // the full offset.
        let far = 1u64 << 33;
        let mut batcher = ScatterBatcher::new();
        batcher.push(ScatterOp::Write, far, 1);
        batcher.push(ScatterOp::Or, far, 2);
        batcher.push(ScatterOp::Write, far + 4, 9);
        let batch = batcher.flush();
        assert_eq!(
            batch,
            vec![
                ScatterUpdate {
                    op: ScatterOp::Write,
                    offset: far,
                    value: 3
                },
                ScatterUpdate {
                    op: ScatterOp::Write,
                    offset: far + 4,
                    value: 9
                }
            ]
        );
    }

    #[test]
    fn test_flush_clears_state() {
        let mut batcher = ScatterBatcher::new();
        batcher.push(ScatterOp::Write, 0, 1);
        assert!(!batcher.flush().is_empty());
        assert!(batcher.is_empty());
        assert!(batcher.flush().is_empty());
        assert_eq!(batcher.total_submitted(), 1);
    }

    #[test]
    fn test_randomized_matches_serial_application() {
        use rand::{rngs::StdRng, Rng, SeedableRng};

        let mut rng = StdRng::seed_from_u64(41);
        for _ in 0..200 {
            let mut batcher = ScatterBatcher::new();
            let mut serial = [0u32; 4];
            let initial: [u32; 4] = [rng.gen(), rng.gen(), rng.gen(), rng.gen()];
            serial.copy_from_slice(&initial);

            for _ in 0..rng.gen_range(1..32) {
                let word = rng.gen_range(0..4usize);
                let value: u32 = rng.gen();
                let op = match rng.gen_range(0..3) {
                    0 => ScatterOp::Or,
                    1 => ScatterOp::And,
                    _ => ScatterOp::Write,
                };
                serial[word] = ScatterUpdate {
                    op,
                    offset: (word * 4) as u64,
                    value,
                }
                .apply(serial[word]);
                batcher.push(op, (word * 4) as u64, value);
            }

            let mut batched = initial;
            for update in batcher.flush() {
                let word = (update.offset / 4) as usize;
                batched[word] = update.apply(batched[word]);
            }
            assert_eq!(batched, serial);
        }
    }
}
