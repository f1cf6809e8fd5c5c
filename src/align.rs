//! Error-tolerant pattern location inside reads.
//!
//! The matcher reports the best occurrence of an adapter pattern in a read
//! under a unit-cost edit model whose equality relation understands IUPAC
//! wildcards on either side. Three engines share one selection rule:
//!
//! - a bit-parallel Myers scan for patterns up to one machine word,
//! - a cost-bounded (Ukkonen cut-off) DP for longer patterns, which doubles
//!   as the start/matches recovery step for the Myers path,
//! - a plain Hamming scan when indels are disabled.
//!
//! 3' ("back") placements are handled natively; 5' ("front") placements run
//! the same engines over the reversed pattern and read, which also yields the
//! tie-breaking rule (earliest position for 5', latest for 3') for free.

use crate::seq::{BASE_MASKS, IUPAC_MASKS};

/// Longest pattern the one-word bit-parallel engine accepts.
pub const MAX_WORD_PATTERN: usize = 64;

/// A located occurrence of a pattern within a read.
///
/// `rstart..rend` is the matched read region, `astart..aend` the aligned
/// pattern region. `matches` counts aligned equal positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hit {
    pub rstart:  usize,
    pub rend:    usize,
    pub astart:  usize,
    pub aend:    usize,
    pub errors:  usize,
    pub matches: usize,
}

impl Hit {
    /// Number of aligned pattern bases.
    #[inline]
    pub fn aligned_len(&self) -> usize {
        self.aend - self.astart
    }
}

/// Per-worker scratch space so the hot path never allocates.
#[derive(Debug, Clone, Default)]
pub struct AlignScratch {
    col: Vec<Cell>,
    rev: Vec<u8>,
}

#[derive(Debug, Clone, Copy, Default)]
struct Cell {
    cost:    usize,
    origin:  usize,
    matches: usize,
}

/// One direction (forward or reversed) of a compiled pattern.
#[derive(Debug, Clone)]
struct Compiled {
    pattern: Vec<u8>,
    /// Allowed-base mask per pattern position (wildcard-expanded when adapter
    /// wildcards are enabled).
    masks:   Vec<u8>,
    /// Myers equality masks, present when the pattern fits in one word.
    peq:     Option<Box<[u64; 256]>>,
}

impl Compiled {
    fn new(pattern: Vec<u8>, adapter_wildcards: bool, read_wildcards: bool) -> Self {
        let masks: Vec<u8> = pattern
            .iter()
            .map(|&b| {
                if adapter_wildcards {
                    IUPAC_MASKS[b as usize]
                } else {
                    BASE_MASKS[b as usize]
                }
            })
            .collect();

        let peq = (pattern.len() <= MAX_WORD_PATTERN).then(|| {
            let mut peq = Box::new([0u64; 256]);
            for s in 0..256usize {
                let mut bits = 0u64;
                for (i, (&p, &mask)) in pattern.iter().zip(&masks).enumerate() {
                    if byte_eq(mask, p, s as u8, read_wildcards) {
                        bits |= 1 << i;
                    }
                }
                peq[s] = bits;
            }
            peq
        });

        Compiled { pattern, masks, peq }
    }
}

/// Equality under the wildcard relation: identical bytes always match;
/// otherwise the expanded base masks must intersect.
#[inline]
fn byte_eq(pattern_mask: u8, pattern_byte: u8, read_byte: u8, read_wildcards: bool) -> bool {
    if pattern_byte == read_byte {
        return true;
    }
    let read_mask = if read_wildcards {
        IUPAC_MASKS[read_byte as usize]
    } else {
        BASE_MASKS[read_byte as usize]
    };
    pattern_mask & read_mask != 0
}

/// A compiled pattern matcher with its constraint set.
#[derive(Debug, Clone)]
pub struct Matcher {
    fwd:            Compiled,
    rev:            Compiled,
    max_errors:     f64,
    min_overlap:    usize,
    allow_indels:   bool,
    read_wildcards: bool,
}

impl Matcher {
    /// Compiles `pattern` for both orientations.
    ///
    /// `max_errors` below 1.0 is a rate applied to the aligned pattern
    /// length; 1.0 or above is an absolute error count. `min_overlap` is
    /// clamped to `1..=pattern.len()`.
    pub fn new(
        pattern: &[u8], max_errors: f64, min_overlap: usize, allow_indels: bool, adapter_wildcards: bool,
        read_wildcards: bool,
    ) -> Self {
        debug_assert!(!pattern.is_empty());
        let min_overlap = min_overlap.clamp(1, pattern.len());
        let rev_pattern: Vec<u8> = pattern.iter().rev().copied().collect();
        Matcher {
            fwd: Compiled::new(pattern.to_vec(), adapter_wildcards, read_wildcards),
            rev: Compiled::new(rev_pattern, adapter_wildcards, read_wildcards),
            max_errors,
            min_overlap,
            allow_indels,
            read_wildcards,
        }
    }

    #[inline]
    pub fn pattern(&self) -> &[u8] {
        &self.fwd.pattern
    }

    #[inline]
    pub fn min_overlap(&self) -> usize {
        self.min_overlap
    }

    #[inline]
    pub fn allow_indels(&self) -> bool {
        self.allow_indels
    }

    /// Equality of pattern position `i` against a read byte, under this
    /// matcher's wildcard settings.
    #[inline]
    pub(crate) fn eq_at(&self, i: usize, byte: u8) -> bool {
        byte_eq(self.fwd.masks[i], self.fwd.pattern[i], byte, self.read_wildcards)
    }

    /// Largest acceptable error count for an alignment covering
    /// `aligned_len` pattern bases.
    #[inline]
    pub fn max_err_for(&self, aligned_len: usize) -> usize {
        if self.max_errors >= 1.0 {
            self.max_errors as usize
        } else {
            (self.max_errors * aligned_len as f64) as usize
        }
    }

    /// Locates the pattern as a 3' adapter: free leading read gap, with
    /// either the full pattern anywhere or a pattern prefix at the read end.
    /// `anchored` pins the full pattern to the read end.
    pub fn locate_back(&self, read: &[u8], anchored: bool, scratch: &mut AlignScratch) -> Option<Hit> {
        self.locate_impl(&self.fwd, read, anchored, &mut scratch.col)
    }

    /// Locates the pattern as a 5' adapter by scanning the reversed read
    /// with the reversed pattern, then mapping coordinates back.
    pub fn locate_front(&self, read: &[u8], anchored: bool, scratch: &mut AlignScratch) -> Option<Hit> {
        let AlignScratch { col, rev } = scratch;
        rev.clear();
        rev.extend(read.iter().rev().copied());
        let hit = self.locate_impl(&self.rev, rev, anchored, col)?;
        let (n, m) = (read.len(), self.fwd.pattern.len());
        Some(Hit {
            rstart:  n - hit.rend,
            rend:    n - hit.rstart,
            astart:  m - hit.aend,
            aend:    m - hit.astart,
            errors:  hit.errors,
            matches: hit.matches,
        })
    }

    fn locate_impl(&self, dir: &Compiled, text: &[u8], anchored: bool, col: &mut Vec<Cell>) -> Option<Hit> {
        if !self.allow_indels {
            return self.hamming(dir, text, anchored);
        }
        if let Some(peq) = &dir.peq {
            self.myers(dir, peq, text, anchored, col)
        } else {
            self.dp(
                &dir.pattern,
                &dir.masks,
                text,
                anchored,
                self.min_overlap,
                col,
            )
        }
    }

    /// Bit-parallel scan (Myers/Hyyrö). Finds the best candidate end
    /// position and aligned pattern length; the start position and match
    /// count are then recovered with a bounded DP over the tail window.
    fn myers(
        &self, dir: &Compiled, peq: &[u64; 256], text: &[u8], anchored: bool, col: &mut Vec<Cell>,
    ) -> Option<Hit> {
        let m = dir.pattern.len();
        let n = text.len();
        let word_mask: u64 = if m == 64 { !0 } else { (1u64 << m) - 1 };
        let high = 1u64 << (m - 1);

        let mut pv: u64 = word_mask;
        let mut mv: u64 = 0;
        let mut score = m;
        let full_budget = self.max_err_for(m);

        // Best full-pattern hit: fewest errors, ties to the later end.
        let mut best_full: Option<(usize, usize)> = None;

        for (idx, &byte) in text.iter().enumerate() {
            let eq = peq[byte as usize];
            let xv = eq | mv;
            let xh = ((eq & pv).wrapping_add(pv) ^ pv) | eq;
            let mut ph = mv | !(xh | pv);
            let mut mh = pv & xh;

            if ph & high != 0 {
                score += 1;
            } else if mh & high != 0 {
                score -= 1;
            }

            // Zero shifted in: the leading read gap is free (search mode).
            ph <<= 1;
            mh <<= 1;
            pv = (mh | !(xv | ph)) & word_mask;
            mv = ph & xv & word_mask;

            if !anchored && score <= full_budget {
                match best_full {
                    Some((cost, _)) if cost < score => {}
                    _ => best_full = Some((score, idx + 1)),
                }
            }
        }

        // (end, cost, aligned pattern length) of the winning candidate.
        let (end, cost, alen) = if anchored {
            if score > full_budget {
                return None;
            }
            (n, score, m)
        } else if let Some((cost, end)) = best_full {
            (end, cost, m)
        } else {
            // Pattern prefix at the read end: walk the final column out of
            // the vertical delta words. Prefer the longest prefix.
            let mut candidate = None;
            let mut dist = 0usize;
            for i in 1..=m.min(n + self.max_err_for(m)) {
                let bit = 1u64 << (i - 1);
                if pv & bit != 0 {
                    dist += 1;
                } else if mv & bit != 0 {
                    dist -= 1;
                }
                if i >= self.min_overlap && i < m && dist <= self.max_err_for(i) {
                    candidate = Some((n, dist, i));
                }
            }
            candidate?
        };

        // Recover the start and match count over the smallest window that
        // can contain the alignment.
        let budget = self.max_err_for(alen);
        let lo = end.saturating_sub(alen + budget);
        let hit = self.dp(
            &dir.pattern[..alen],
            &dir.masks[..alen],
            &text[lo..end],
            true,
            self.min_overlap.min(alen),
            col,
        )?;
        debug_assert!(hit.errors <= cost);
        Some(Hit {
            rstart: lo + hit.rstart,
            rend:   end,
            astart: 0,
            aend:   alen,
            errors: hit.errors,
            matches: hit.matches,
        })
    }

    /// Cost-bounded semi-global DP with origin and match tracking. The
    /// leading read gap is always free; `anchored` requires consuming the
    /// full pattern and ending at the last read byte.
    fn dp(
        &self, pattern: &[u8], masks: &[u8], text: &[u8], anchored: bool, min_overlap: usize, col: &mut Vec<Cell>,
    ) -> Option<Hit> {
        let m = pattern.len();
        let n = text.len();
        let budget = self.max_err_for(m);

        col.clear();
        col.extend((0..=m).map(|i| Cell {
            cost:    i,
            origin:  0,
            matches: 0,
        }));

        let mut best: Option<Hit> = None;
        // Rows below `last` are known to exceed the budget (Ukkonen cut-off).
        let mut last = m.min(budget + 1);
        let mut reached = last;

        for j in 1..=n {
            let mut diag = col[0];
            col[0] = Cell {
                cost:    0,
                origin:  j,
                matches: 0,
            };

            for i in 1..=last {
                let left = col[i];
                let eq = byte_eq(masks[i - 1], pattern[i - 1], text[j - 1], self.read_wildcards);
                let mut cell = Cell {
                    cost:    diag.cost + usize::from(!eq),
                    origin:  diag.origin,
                    matches: diag.matches + usize::from(eq),
                };
                if left.cost + 1 < cell.cost {
                    cell = Cell {
                        cost: left.cost + 1,
                        ..left
                    };
                }
                let up = col[i - 1];
                if up.cost + 1 < cell.cost {
                    cell = Cell {
                        cost: up.cost + 1,
                        ..up
                    };
                }
                diag = left;
                col[i] = cell;
            }
            reached = last;

            if last == m && (!anchored || j == n) {
                let cell = col[m];
                if cell.cost <= budget {
                    let better = match &best {
                        None => true,
                        Some(b) => cell.cost < b.errors || cell.cost == b.errors,
                    };
                    if better {
                        best = Some(Hit {
                            rstart:  cell.origin,
                            rend:    j,
                            astart:  0,
                            aend:    m,
                            errors:  cell.cost,
                            matches: cell.matches,
                        });
                    }
                }
            }

            while last > 0 && col[last].cost > budget {
                last -= 1;
            }
            if last < m {
                last += 1;
                // Upper-bound sentinel; the true value also exceeds the
                // budget, so no acceptable path can flow through it.
                col[last] = Cell {
                    cost:    budget + 1,
                    origin:  0,
                    matches: 0,
                };
            }
        }

        if best.is_some() || anchored {
            return best;
        }

        // Pattern prefix aligned to the read end. Only rows computed for the
        // final column are trustworthy; deeper rows exceed the budget anyway.
        let mut partial: Option<Hit> = None;
        for i in (min_overlap..m.min(reached + 1)).rev() {
            let cell = col[i];
            if cell.cost <= self.max_err_for(i) {
                partial = Some(Hit {
                    rstart:  cell.origin,
                    rend:    n,
                    astart:  0,
                    aend:    i,
                    errors:  cell.cost,
                    matches: cell.matches,
                });
                break;
            }
        }
        partial
    }

    /// Substitution-only scan used when indels are disabled.
    fn hamming(&self, dir: &Compiled, text: &[u8], anchored: bool) -> Option<Hit> {
        let m = dir.pattern.len();
        let n = text.len();

        let count = |window: &[u8], len: usize, budget: usize| -> Option<(usize, usize)> {
            let mut errors = 0;
            let mut matches = 0;
            for (i, &s) in window.iter().take(len).enumerate() {
                if byte_eq(dir.masks[i], dir.pattern[i], s, self.read_wildcards) {
                    matches += 1;
                } else {
                    errors += 1;
                    if errors > budget {
                        return None;
                    }
                }
            }
            Some((errors, matches))
        };

        if anchored {
            if n < m {
                return None;
            }
            let (errors, matches) = count(&text[n - m..], m, self.max_err_for(m))?;
            return Some(Hit {
                rstart: n - m,
                rend: n,
                astart: 0,
                aend: m,
                errors,
                matches,
            });
        }

        let budget = self.max_err_for(m);
        let mut best: Option<Hit> = None;
        if n >= m {
            for rstart in 0..=n - m {
                if let Some((errors, matches)) = count(&text[rstart..], m, budget) {
                    let better = match &best {
                        None => true,
                        Some(b) => errors <= b.errors,
                    };
                    if better {
                        best = Some(Hit {
                            rstart,
                            rend: rstart + m,
                            astart: 0,
                            aend: m,
                            errors,
                            matches,
                        });
                    }
                }
            }
        }
        if best.is_some() {
            return best;
        }

        for i in (self.min_overlap..m.min(n + 1)).rev() {
            if let Some((errors, matches)) = count(&text[n - i..], i, self.max_err_for(i)) {
                return Some(Hit {
                    rstart: n - i,
                    rend: n,
                    astart: 0,
                    aend: i,
                    errors,
                    matches,
                });
            }
        }
        None
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn matcher(pattern: &[u8], rate: f64) -> Matcher {
        Matcher::new(pattern, rate, 3, true, true, false)
    }

    #[test]
    fn exact_back_match() {
        let m = matcher(b"AAAATTTT", 0.0);
        let mut scratch = AlignScratch::default();
        let hit = m.locate_back(b"ACGTACGTAAAATTTT", false, &mut scratch).unwrap();
        assert_eq!((hit.rstart, hit.rend, hit.errors), (8, 16, 0));
        assert_eq!(hit.matches, 8);
    }

    #[test]
    fn partial_suffix_match() {
        let m = matcher(b"AGATCGGAAGAG", 0.0);
        let mut scratch = AlignScratch::default();
        // Only the first 6 adapter bases fit at the read end.
        let hit = m.locate_back(b"ACGTACGTACGTAGATCG", false, &mut scratch).unwrap();
        assert_eq!((hit.rstart, hit.rend), (12, 18));
        assert_eq!(hit.aligned_len(), 6);
        assert_eq!(hit.errors, 0);
    }

    #[test]
    fn min_overlap_suppresses_short_hits() {
        let m = Matcher::new(b"AGATCGGAAGAG", 0.0, 8, true, true, false);
        let mut scratch = AlignScratch::default();
        assert!(m.locate_back(b"ACGTACGTACGTAGATCG", false, &mut scratch).is_none());
    }

    #[test]
    fn error_rate_budget_scales_with_length() {
        let m = matcher(b"AAAAAAAAAA", 0.1);
        assert_eq!(m.max_err_for(10), 1);
        assert_eq!(m.max_err_for(5), 0);
        let abs = Matcher::new(b"AAAAAAAAAA", 2.0, 3, true, true, false);
        assert_eq!(abs.max_err_for(10), 2);
        assert_eq!(abs.max_err_for(4), 2);
    }

    #[test]
    fn one_substitution_within_rate() {
        let m = matcher(b"AAAATTTT", 0.2);
        let mut scratch = AlignScratch::default();
        let hit = m.locate_back(b"ACGTACGTAAAGTTTT", false, &mut scratch).unwrap();
        assert_eq!((hit.rstart, hit.rend, hit.errors), (8, 16, 1));
        assert_eq!(hit.matches, 7);
    }

    #[test]
    fn indel_found_when_allowed() {
        let m = matcher(b"AAAATTTT", 0.2);
        let mut scratch = AlignScratch::default();
        // One base missing inside the adapter occurrence. A substitution
        // alignment starting one base earlier has the same cost, so only the
        // error count and end are pinned down.
        let hit = m.locate_back(b"ACGTACGTAAATTTT", false, &mut scratch).unwrap();
        assert_eq!(hit.errors, 1);
        assert!(hit.rstart == 7 || hit.rstart == 8);
        assert_eq!(hit.rend, 15);
    }

    #[test]
    fn hamming_mode_rejects_indels() {
        let m = Matcher::new(b"AAAATTTT", 0.2, 3, false, true, false);
        let mut scratch = AlignScratch::default();
        let hit = m.locate_back(b"ACGTAAAATTTTACGT", false, &mut scratch);
        // Full occurrence mid-read is fine without indels.
        assert_eq!(hit.map(|h| (h.rstart, h.rend, h.errors)), Some((4, 12, 0)));
    }

    #[test]
    fn anchored_back_requires_end_placement() {
        let m = matcher(b"TTTT", 0.0);
        let mut scratch = AlignScratch::default();
        assert!(m.locate_back(b"AATTTTAA", true, &mut scratch).is_none());
        let hit = m.locate_back(b"AAAATTTT", true, &mut scratch).unwrap();
        assert_eq!((hit.rstart, hit.rend), (4, 8));
    }

    #[test]
    fn front_match_maps_coordinates() {
        let m = matcher(b"GGGG", 0.0);
        let mut scratch = AlignScratch::default();
        let hit = m.locate_front(b"GGGGCATCAT", true, &mut scratch).unwrap();
        assert_eq!((hit.rstart, hit.rend, hit.errors), (0, 4, 0));
        assert_eq!((hit.astart, hit.aend), (0, 4));
    }

    #[test]
    fn front_partial_prefix() {
        let m = matcher(b"TTTTGGGG", 0.0);
        let mut scratch = AlignScratch::default();
        // Only the adapter suffix GGGG overlaps the 5' end of the read.
        let hit = m.locate_front(b"GGGGCATCAT", false, &mut scratch).unwrap();
        assert_eq!((hit.rstart, hit.rend), (0, 4));
        assert_eq!((hit.astart, hit.aend), (4, 8));
    }

    #[test]
    fn wildcards_in_adapter() {
        let m = Matcher::new(b"ANNA", 0.0, 3, true, true, false);
        let mut scratch = AlignScratch::default();
        let hit = m.locate_back(b"CCCCACGA", false, &mut scratch).unwrap();
        assert_eq!((hit.rstart, hit.rend, hit.errors), (4, 8, 0));
    }

    #[test]
    fn read_wildcards_only_when_enabled() {
        let strict = Matcher::new(b"ACGT", 0.0, 3, true, true, false);
        let lax = Matcher::new(b"ACGT", 0.0, 3, true, true, true);
        let mut scratch = AlignScratch::default();
        assert!(strict.locate_back(b"TTTTACNT", false, &mut scratch).is_none());
        let hit = lax.locate_back(b"TTTTACNT", false, &mut scratch).unwrap();
        assert_eq!((hit.rstart, hit.rend, hit.errors), (4, 8, 0));
    }

    #[test]
    fn long_pattern_uses_dp_fallback() {
        let pattern: Vec<u8> = std::iter::repeat(b"ACGT")
            .take(20)
            .flatten()
            .copied()
            .collect();
        assert!(pattern.len() > MAX_WORD_PATTERN);
        let m = Matcher::new(&pattern, 0.1, 3, true, true, false);
        let mut scratch = AlignScratch::default();
        let mut read = b"TTTTTTTT".to_vec();
        read.extend_from_slice(&pattern);
        let hit = m.locate_back(&read, false, &mut scratch).unwrap();
        assert_eq!((hit.rstart, hit.rend, hit.errors), (8, 88, 0));
    }

    #[test]
    fn word_and_dp_engines_agree() {
        // The bit-parallel engine and the DP must agree on aligned length
        // and error count for the same inputs.
        let pattern = b"AGATCGGAAGAGC";
        let word = Matcher::new(pattern, 0.1, 3, true, true, false);
        let mut scratch = AlignScratch::default();
        let reads: [&[u8]; 5] = [
            b"ACGTACGTACGTAGATCGGAAGAGC",
            b"AGATCGGAAGAGCACGT",
            b"ACGTAGATCGGTAGAGCAA",
            b"AAAAAAAA",
            b"AGATCG",
        ];
        for read in reads {
            let via_myers = word.locate_back(read, false, &mut scratch);
            let via_dp = word.dp(
                &word.fwd.pattern,
                &word.fwd.masks,
                read,
                false,
                word.min_overlap,
                &mut scratch.col,
            );
            match (via_myers, via_dp) {
                (None, None) => {}
                (Some(a), Some(b)) => {
                    assert_eq!(a.aligned_len(), b.aligned_len(), "read {:?}", read);
                    assert_eq!(a.errors, b.errors, "read {:?}", read);
                }
                (a, b) => panic!("engines disagree on {:?}: {:?} vs {:?}", read, a, b),
            }
        }
    }

    #[test]
    fn reported_errors_within_budget() {
        let m = matcher(b"AGATCGGAAGAGC", 0.2);
        let mut scratch = AlignScratch::default();
        for read in [
            &b"ACGTACGTAGATCGGAAGAGC"[..],
            b"ACGTACGTAGATCGGTAGAGC",
            b"AGATAGATAGATAGAT",
            b"CCCCCCCCCCAGATC",
        ] {
            if let Some(hit) = m.locate_back(read, false, &mut scratch) {
                assert!(hit.errors <= m.max_err_for(hit.aligned_len()));
                assert!(hit.aligned_len() >= m.min_overlap());
            }
        }
    }
}
