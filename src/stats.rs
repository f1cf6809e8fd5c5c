//! Run statistics and the text report.
//!
//! `Statistics` is a commutative monoid: each worker folds its own instance
//! and the runner sums them once all chunks are written, so the hot path
//! never takes a lock.

use crate::adapters::{Adapter, MatchSide, Placement};
use foldhash::HashMap;
use indoc::writedoc;
use itertools::Itertools;
use std::io::Write;

/// Accounting for one adapter end (5' or 3').
#[derive(Debug, Clone, Default)]
pub struct AdapterSideStats {
    /// Removed-sequence length -> occurrence count.
    pub lengths: HashMap<usize, u64>,
    /// Aligned pattern length -> (error count -> occurrences).
    pub errors:  HashMap<usize, HashMap<usize, u64>>,
}

impl AdapterSideStats {
    #[inline]
    pub fn record(&mut self, removed_len: usize, aligned_len: usize, errors: usize) {
        *self.lengths.entry(removed_len).or_default() += 1;
        *self
            .errors
            .entry(aligned_len)
            .or_default()
            .entry(errors)
            .or_default() += 1;
    }

    #[inline]
    pub fn count(&self) -> u64 {
        self.lengths.values().sum()
    }

    fn merge(&mut self, other: AdapterSideStats) {
        for (len, n) in other.lengths {
            *self.lengths.entry(len).or_default() += n;
        }
        for (len, errs) in other.errors {
            let slot = self.errors.entry(len).or_default();
            for (e, n) in errs {
                *slot.entry(e).or_default() += n;
            }
        }
    }
}

/// Accounting for one adapter.
#[derive(Debug, Clone, Default)]
pub struct AdapterStats {
    pub front: AdapterSideStats,
    pub back:  AdapterSideStats,
    /// Read bases observed at wildcard positions of the pattern.
    pub wildcard_bases: u64,
}

impl AdapterStats {
    #[inline]
    pub fn side_mut(&mut self, side: MatchSide) -> &mut AdapterSideStats {
        match side {
            MatchSide::Front => &mut self.front,
            MatchSide::Back => &mut self.back,
        }
    }

    #[inline]
    pub fn count(&self) -> u64 {
        self.front.count() + self.back.count()
    }

    fn merge(&mut self, other: AdapterStats) {
        self.front.merge(other.front);
        self.back.merge(other.back);
        self.wildcard_bases += other.wildcard_bases;
    }
}

/// Global counters plus per-adapter slots for both read sides. Identity is
/// all-zero; `merge` is pointwise addition.
#[derive(Debug, Clone, Default)]
pub struct Statistics {
    /// Reads (single-end) or pairs (paired-end) seen.
    pub records: u64,
    pub total_bp: [u64; 2],
    pub quality_trimmed_bp: [u64; 2],
    pub reads_with_adapters: [u64; 2],
    pub reverse_complemented: u64,

    pub filtered_too_short: u64,
    pub filtered_too_long: u64,
    pub filtered_max_n: u64,
    pub filtered_max_ee: u64,
    pub filtered_casava: u64,
    pub filtered_discard_trimmed: u64,
    pub filtered_discard_untrimmed: u64,

    /// Records written to a main (or demultiplex) output.
    pub written: u64,
    pub written_bp: [u64; 2],

    /// Per-adapter slots, indexed like the adapter lists for R1 and R2.
    pub adapters: [Vec<AdapterStats>; 2],
}

impl Statistics {
    pub fn new(n_adapters1: usize, n_adapters2: usize) -> Self {
        Statistics {
            adapters: [
                vec![AdapterStats::default(); n_adapters1],
                vec![AdapterStats::default(); n_adapters2],
            ],
            ..Statistics::default()
        }
    }

    /// Pointwise addition of `other` into `self`.
    pub fn merge(&mut self, other: Statistics) {
        self.records += other.records;
        self.reverse_complemented += other.reverse_complemented;
        self.filtered_too_short += other.filtered_too_short;
        self.filtered_too_long += other.filtered_too_long;
        self.filtered_max_n += other.filtered_max_n;
        self.filtered_max_ee += other.filtered_max_ee;
        self.filtered_casava += other.filtered_casava;
        self.filtered_discard_trimmed += other.filtered_discard_trimmed;
        self.filtered_discard_untrimmed += other.filtered_discard_untrimmed;
        self.written += other.written;
        for i in 0..2 {
            self.total_bp[i] += other.total_bp[i];
            self.quality_trimmed_bp[i] += other.quality_trimmed_bp[i];
            self.reads_with_adapters[i] += other.reads_with_adapters[i];
            self.written_bp[i] += other.written_bp[i];
        }
        for (side, theirs) in other.adapters.into_iter().enumerate() {
            debug_assert_eq!(self.adapters[side].len(), theirs.len());
            for (slot, stat) in self.adapters[side].iter_mut().zip(theirs) {
                slot.merge(stat);
            }
        }
    }

    #[inline]
    pub fn total_filtered(&self) -> u64 {
        self.filtered_too_short
            + self.filtered_too_long
            + self.filtered_max_n
            + self.filtered_max_ee
            + self.filtered_casava
            + self.filtered_discard_trimmed
            + self.filtered_discard_untrimmed
    }
}

/// Writes the one-line machine-readable report.
///
/// ## Errors
///
/// Any IO error from the writer is propagated.
pub fn write_minimal_report<W: Write>(stats: &Statistics, paired: bool, writer: &mut W) -> std::io::Result<()> {
    writeln!(
        writer,
        "status\tin_reads\tin_bp\ttoo_short\ttoo_long\ttoo_many_n\tout_reads\tw/adapters\tqualtrim_bp\tout_bp{}",
        if paired { "\tw/adapters2\tqualtrim2_bp\tout2_bp" } else { "" }
    )?;
    write!(
        writer,
        "OK\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
        stats.records,
        stats.total_bp[0] + stats.total_bp[1],
        stats.filtered_too_short,
        stats.filtered_too_long,
        stats.filtered_max_n,
        stats.written,
        stats.reads_with_adapters[0],
        stats.quality_trimmed_bp[0],
        stats.written_bp[0],
    )?;
    if paired {
        write!(
            writer,
            "\t{}\t{}\t{}",
            stats.reads_with_adapters[1], stats.quality_trimmed_bp[1], stats.written_bp[1]
        )?;
    }
    writeln!(writer)
}

/// Writes the human-readable report: a summary block plus one section per
/// adapter with its removed-length histogram.
///
/// ## Errors
///
/// Any IO error from the writer is propagated.
pub fn write_report<W: Write>(
    stats: &Statistics, adapters: [&[Adapter]; 2], paired: bool, writer: &mut W,
) -> std::io::Result<()> {
    let record_word = if paired { "pairs" } else { "reads" };
    writedoc!(
        writer,
        "
        === Summary ===

        Total {record_word} processed:  {records}
        Reads with adapters (R1):  {with1}
        ",
        records = stats.records,
        with1 = stats.reads_with_adapters[0],
    )?;
    if paired {
        writeln!(writer, "Reads with adapters (R2):  {}", stats.reads_with_adapters[1])?;
    }
    writedoc!(
        writer,
        "
        {record_word} written (passing filters):  {written}

        Total basepairs processed:  {total_bp} bp
        Quality-trimmed:  {qt} bp
        Total written (filtered):  {written_bp} bp
        ",
        written = stats.written,
        total_bp = stats.total_bp[0] + stats.total_bp[1],
        qt = stats.quality_trimmed_bp[0] + stats.quality_trimmed_bp[1],
        written_bp = stats.written_bp[0] + stats.written_bp[1],
    )?;

    if stats.total_filtered() > 0 {
        writedoc!(
            writer,
            "

            === Filters ===

            Too short:  {short}
            Too long:  {long}
            Too many N:  {n}
            Too many expected errors:  {ee}
            Failed chastity filter:  {casava}
            Discarded as trimmed:  {dt}
            Discarded as untrimmed:  {du}
            ",
            short = stats.filtered_too_short,
            long = stats.filtered_too_long,
            n = stats.filtered_max_n,
            ee = stats.filtered_max_ee,
            casava = stats.filtered_casava,
            dt = stats.filtered_discard_trimmed,
            du = stats.filtered_discard_untrimmed,
        )?;
    }
    if stats.reverse_complemented > 0 {
        writeln!(writer, "Reverse-complemented:  {}", stats.reverse_complemented)?;
    }

    for (side, list) in adapters.iter().enumerate() {
        for (adapter, astats) in list.iter().zip(&stats.adapters[side]) {
            write_adapter_section(adapter, astats, side, writer)?;
        }
    }
    Ok(())
}

fn write_adapter_section<W: Write>(
    adapter: &Adapter, stats: &AdapterStats, side: usize, writer: &mut W,
) -> std::io::Result<()> {
    let kind = match (adapter.placement, adapter.anchored) {
        (Placement::Back, false) => "regular 3'",
        (Placement::Back, true) => "anchored 3'",
        (Placement::Front, false) => "regular 5'",
        (Placement::Front, true) => "anchored 5'",
        (Placement::Anywhere, _) => "anywhere",
    };
    writedoc!(
        writer,
        "

        === {which} Adapter {name} ===

        Sequence: {seq}; Type: {kind}; Length: {len}; Trimmed: {count} times
        ",
        which = if side == 0 { "First read:" } else { "Second read:" },
        name = adapter.name,
        seq = String::from_utf8_lossy(&adapter.pattern),
        len = adapter.len(),
        count = stats.count(),
    )?;
    if stats.wildcard_bases > 0 {
        writeln!(writer, "Wildcard bases recorded: {}", stats.wildcard_bases)?;
    }

    for (label, side_stats) in [("5'", &stats.front), ("3'", &stats.back)] {
        if side_stats.count() == 0 {
            continue;
        }
        writeln!(writer, "\nOverview of removed sequences ({label} end)\nlength\tcount")?;
        for (len, n) in side_stats.lengths.iter().sorted() {
            writeln!(writer, "{len}\t{n}")?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::adapters::MatchSide;

    fn sample(seed: u64) -> Statistics {
        let mut s = Statistics::new(1, 0);
        s.records = seed;
        s.total_bp[0] = seed * 10;
        s.filtered_too_short = seed / 2;
        s.written = seed - seed / 2;
        s.adapters[0][0]
            .side_mut(MatchSide::Back)
            .record(4, 4, (seed % 3) as usize);
        s
    }

    #[test]
    fn merge_is_pointwise_addition() {
        let mut total = Statistics::new(1, 0);
        let mut serial = Statistics::new(1, 0);
        for seed in [3u64, 5, 8] {
            total.merge(sample(seed));
        }
        // Fold in a different grouping; the result must be identical.
        let mut left = sample(3);
        left.merge(sample(5));
        serial.merge(left);
        serial.merge(sample(8));

        assert_eq!(total.records, serial.records);
        assert_eq!(total.total_bp, serial.total_bp);
        assert_eq!(total.filtered_too_short, serial.filtered_too_short);
        assert_eq!(total.written, serial.written);
        assert_eq!(
            total.adapters[0][0].back.lengths,
            serial.adapters[0][0].back.lengths
        );
        assert_eq!(
            total.adapters[0][0].back.errors,
            serial.adapters[0][0].back.errors
        );
    }

    #[test]
    fn identity_is_all_zero() {
        let mut s = sample(7);
        let before = format!("{s:?}");
        s.merge(Statistics::new(1, 0));
        assert_eq!(before, format!("{s:?}"));
    }
}
