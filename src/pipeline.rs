//! The ordered modifier chain, the filter set, and the per-record verdict
//! that drives output routing.

use crate::{
    adapters::Adapter,
    align::AlignScratch,
    modifiers::{ModContext, PairedModifier, ReadInfo},
    seq::{expected_errors, SeqRecord},
    stats::Statistics,
};
use std::sync::Arc;

/// When to drop a pair based on its two per-read filter results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairFilterMode {
    /// Drop if either read fails.
    Any,
    /// Drop only if both reads fail.
    Both,
    /// Drop iff R1 fails.
    First,
}

/// Filter thresholds, applied after all modifiers.
#[derive(Debug, Clone, Default)]
pub struct Filters {
    pub min_length: [Option<usize>; 2],
    pub max_length: [Option<usize>; 2],
    /// Absolute count when >= 1, else a fraction of the read length.
    pub max_n: Option<f64>,
    pub max_expected_errors: Option<f64>,
    pub discard_casava: bool,
    pub discard_trimmed: bool,
    pub discard_untrimmed: bool,
}

/// The routing decision for a processed record or pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Keep,
    TooShort,
    TooLong,
    TooManyN,
    TooManyExpectedErrors,
    Casava,
    DiscardTrimmed,
    DiscardUntrimmed,
}

/// Filter evaluation order; the first failing filter decides the verdict.
const FILTER_ORDER: [FilterKind; 7] = [
    FilterKind::TooShort,
    FilterKind::TooLong,
    FilterKind::MaxN,
    FilterKind::MaxExpectedErrors,
    FilterKind::Casava,
    FilterKind::DiscardTrimmed,
    FilterKind::DiscardUntrimmed,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FilterKind {
    TooShort,
    TooLong,
    MaxN,
    MaxExpectedErrors,
    Casava,
    DiscardTrimmed,
    DiscardUntrimmed,
}

impl FilterKind {
    fn verdict(self) -> Verdict {
        match self {
            FilterKind::TooShort => Verdict::TooShort,
            FilterKind::TooLong => Verdict::TooLong,
            FilterKind::MaxN => Verdict::TooManyN,
            FilterKind::MaxExpectedErrors => Verdict::TooManyExpectedErrors,
            FilterKind::Casava => Verdict::Casava,
            FilterKind::DiscardTrimmed => Verdict::DiscardTrimmed,
            FilterKind::DiscardUntrimmed => Verdict::DiscardUntrimmed,
        }
    }
}

/// One processing pipeline: constructed once per invocation, shared
/// read-only across workers. All mutable state (statistics, scratch, the
/// per-read infos) is owned by the caller.
#[derive(Debug)]
pub struct Pipeline {
    pub steps: Vec<PairedModifier>,
    pub filters: Filters,
    pub pair_filter_mode: PairFilterMode,
    /// With adapters on one side only, `ANY` would treat every pair as
    /// untrimmed; the untrimmed predicate then uses `BOTH` instead.
    pub override_untrimmed_pair_filter: bool,
    pub adapters1: Arc<Vec<Adapter>>,
    pub adapters2: Arc<Vec<Adapter>>,
    pub quality_base: u8,
    /// Capture per-match read snapshots (side files, rename templates).
    pub collect_snapshots: bool,
    pub paired: bool,
}

impl Pipeline {
    /// Runs the modifier chain and filters over a single-end record.
    pub fn process_single(
        &self, read: &mut SeqRecord, info: &mut ReadInfo, stats: &mut Statistics, scratch: &mut AlignScratch,
    ) -> Verdict {
        info.clear();
        stats.records += 1;
        stats.total_bp[0] += read.len() as u64;

        for step in &self.steps {
            if let PairedModifier::Each(Some(modifier), _) = step {
                let mut ctx = ModContext {
                    stats,
                    scratch,
                    side: 0,
                    adapters: &self.adapters1,
                    collect: self.collect_snapshots,
                };
                modifier.apply(read, info, &mut ctx);
            }
        }

        let verdict = FILTER_ORDER
            .iter()
            .find(|kind| self.read_fails(**kind, read, info, 0))
            .map(|kind| kind.verdict())
            .unwrap_or(Verdict::Keep);
        self.tally(verdict, stats);
        if verdict == Verdict::Keep {
            stats.written += 1;
            stats.written_bp[0] += read.len() as u64;
        }
        verdict
    }

    /// Runs the modifier chain over a pair, then applies the pair filter.
    pub fn process_pair(
        &self, r1: &mut SeqRecord, r2: &mut SeqRecord, info1: &mut ReadInfo, info2: &mut ReadInfo,
        stats: &mut Statistics, scratch: &mut AlignScratch,
    ) -> Verdict {
        info1.clear();
        info2.clear();
        stats.records += 1;
        stats.total_bp[0] += r1.len() as u64;
        stats.total_bp[1] += r2.len() as u64;

        for step in &self.steps {
            match step {
                PairedModifier::Each(m1, m2) => {
                    if let Some(modifier) = m1 {
                        let mut ctx = ModContext {
                            stats: &mut *stats,
                            scratch: &mut *scratch,
                            side: 0,
                            adapters: &self.adapters1,
                            collect: self.collect_snapshots,
                        };
                        modifier.apply(r1, info1, &mut ctx);
                    }
                    if let Some(modifier) = m2 {
                        let mut ctx = ModContext {
                            stats: &mut *stats,
                            scratch: &mut *scratch,
                            side: 1,
                            adapters: &self.adapters2,
                            collect: self.collect_snapshots,
                        };
                        modifier.apply(r2, info2, &mut ctx);
                    }
                }
                PairedModifier::PairedAdapterCut(cutter) => {
                    cutter.apply_pair(r1, r2, info1, info2, stats, scratch, self.collect_snapshots);
                }
                PairedModifier::PairedRename(renamer) => {
                    let name = renamer.render(r1, info1, &self.adapters1, Some((r2, info2, &self.adapters2)));
                    r1.head = name.clone();
                    r2.head = name;
                }
            }
        }

        let verdict = FILTER_ORDER
            .iter()
            .find(|kind| {
                let f1 = self.read_fails(**kind, r1, info1, 0);
                let f2 = self.read_fails(**kind, r2, info2, 1);
                self.pair_fails(**kind, f1, f2)
            })
            .map(|kind| kind.verdict())
            .unwrap_or(Verdict::Keep);
        self.tally(verdict, stats);
        if verdict == Verdict::Keep {
            stats.written += 1;
            stats.written_bp[0] += r1.len() as u64;
            stats.written_bp[1] += r2.len() as u64;
        }
        verdict
    }

    fn pair_fails(&self, kind: FilterKind, f1: bool, f2: bool) -> bool {
        let mode = if kind == FilterKind::DiscardUntrimmed && self.override_untrimmed_pair_filter {
            PairFilterMode::Both
        } else {
            self.pair_filter_mode
        };
        match mode {
            PairFilterMode::Any => f1 || f2,
            PairFilterMode::Both => f1 && f2,
            PairFilterMode::First => f1,
        }
    }

    fn read_fails(&self, kind: FilterKind, read: &SeqRecord, info: &ReadInfo, side: usize) -> bool {
        match kind {
            FilterKind::TooShort => self.filters.min_length[side].is_some_and(|min| read.len() < min),
            FilterKind::TooLong => self.filters.max_length[side].is_some_and(|max| read.len() > max),
            FilterKind::MaxN => self.filters.max_n.is_some_and(|limit| {
                let n = read
                    .seq
                    .iter()
                    .filter(|b| b.eq_ignore_ascii_case(&b'N'))
                    .count() as f64;
                if limit >= 1.0 || limit == 0.0 {
                    n > limit
                } else if read.is_empty() {
                    false
                } else {
                    n / read.len() as f64 > limit
                }
            }),
            FilterKind::MaxExpectedErrors => self.filters.max_expected_errors.is_some_and(|limit| {
                read.qual
                    .as_ref()
                    .is_some_and(|qual| expected_errors(qual, self.quality_base) > limit)
            }),
            FilterKind::Casava => self.filters.discard_casava && casava_filtered(read),
            FilterKind::DiscardTrimmed => self.filters.discard_trimmed && info.is_trimmed,
            FilterKind::DiscardUntrimmed => self.filters.discard_untrimmed && !info.is_trimmed,
        }
    }

    fn tally(&self, verdict: Verdict, stats: &mut Statistics) {
        match verdict {
            Verdict::Keep => {}
            Verdict::TooShort => stats.filtered_too_short += 1,
            Verdict::TooLong => stats.filtered_too_long += 1,
            Verdict::TooManyN => stats.filtered_max_n += 1,
            Verdict::TooManyExpectedErrors => stats.filtered_max_ee += 1,
            Verdict::Casava => stats.filtered_casava += 1,
            Verdict::DiscardTrimmed => stats.filtered_discard_trimmed += 1,
            Verdict::DiscardUntrimmed => stats.filtered_discard_untrimmed += 1,
        }
    }
}

/// True when the Illumina chastity field of the header comment marks the
/// read as filtered (`<read>:Y:<flags>:<barcode>`).
fn casava_filtered(read: &SeqRecord) -> bool {
    let Some(comment) = read.comment() else {
        return false;
    };
    let mut fields = comment.split(|&b| b == b':');
    let first = fields.next().unwrap_or_default();
    let second = fields.next().unwrap_or_default();
    first.len() == 1 && first[0].is_ascii_digit() && second == b"Y" && fields.next().is_some()
}
