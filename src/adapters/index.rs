//! A shared prefix index over a set of anchored 5' adapters.
//!
//! When every adapter must match gap-free at the very start of the read, the
//! first `k` read bases decide which adapters can possibly match. The index
//! enumerates, per adapter, every `k`-mer over `ACGTN` within the adapter's
//! substitution budget and maps it (3-bit packed) to the candidate adapters.
//! Probing the read prefix then replaces the scan over the whole adapter set;
//! the full aligner still runs on the candidates, so the index changes which
//! adapters are *tried*, never which match is *reported*.

use super::{Adapter, Placement};
use foldhash::{HashMap, HashMapExt};

/// 3 bits per base in a single word.
pub const MAX_INDEX_KMER: usize = 21;

/// Gives up on indexing (falling back to the plain scan) rather than letting
/// high error budgets blow up the enumeration.
const MAX_INDEX_ENTRIES: usize = 1 << 16;

const ALPHABET: [u8; 5] = [b'A', b'C', b'G', b'T', b'N'];

#[derive(Debug, Clone)]
pub struct PrefixIndex {
    k:   usize,
    map: HashMap<u64, Vec<usize>>,
}

impl PrefixIndex {
    /// Builds an index over `adapters`, or `None` when the set is not
    /// indexable: every adapter must be an anchored 5' adapter with indels
    /// disabled, and the enumeration must stay within bounds.
    pub fn build(adapters: &[Adapter]) -> Option<PrefixIndex> {
        if adapters.is_empty() {
            return None;
        }
        if adapters.iter().any(|a| {
            a.placement != Placement::Front || !a.anchored || a.matcher().allow_indels()
        }) {
            return None;
        }

        let k = adapters
            .iter()
            .map(|a| a.matcher().min_overlap().min(a.len()))
            .min()?
            .min(MAX_INDEX_KMER);

        let mut map: HashMap<u64, Vec<usize>> = HashMap::new();
        for (ix, adapter) in adapters.iter().enumerate() {
            let budget = adapter.matcher().max_err_for(adapter.len()).min(k);
            if !insert_variants(adapter, ix, k, 0, 0, budget, &mut map) {
                return None;
            }
        }
        Some(PrefixIndex { k, map })
    }

    #[inline]
    pub fn k(&self) -> usize {
        self.k
    }

    /// Candidate adapters for a read. `None` means the read prefix cannot be
    /// encoded (rare bytes outside `ACGTN`) and the caller must scan all
    /// adapters; `Some(&[])` means no adapter can match.
    pub fn candidates(&self, seq: &[u8]) -> Option<&[usize]> {
        if seq.len() < self.k {
            // Anchored gap-free adapters cannot match a read shorter than
            // any of their prefixes.
            return Some(&[]);
        }
        let mut key = 0u64;
        for (i, &base) in seq[..self.k].iter().enumerate() {
            key |= encode_base(base)? << (3 * i);
        }
        Some(self.map.get(&key).map(Vec::as_slice).unwrap_or(&[]))
    }
}

#[inline]
fn encode_base(base: u8) -> Option<u64> {
    match base.to_ascii_uppercase() {
        b'A' => Some(0),
        b'C' => Some(1),
        b'G' => Some(2),
        b'T' => Some(3),
        b'N' => Some(4),
        _ => None,
    }
}

/// Depth-first enumeration of all read prefixes within `budget`
/// substitutions of the adapter prefix. Returns false when the index grows
/// past its entry cap.
fn insert_variants(
    adapter: &Adapter, ix: usize, k: usize, pos: usize, key: u64, budget: usize,
    map: &mut HashMap<u64, Vec<usize>>,
) -> bool {
    if map.len() > MAX_INDEX_ENTRIES {
        return false;
    }
    if pos == k {
        map.entry(key).or_default().push(ix);
        return true;
    }
    for (code, &base) in ALPHABET.iter().enumerate() {
        let cost = usize::from(!adapter.matcher().eq_at(pos, base));
        if cost <= budget
            && !insert_variants(
                adapter,
                ix,
                k,
                pos + 1,
                key | (code as u64) << (3 * pos),
                budget - cost,
                map,
            )
        {
            return false;
        }
    }
    true
}
