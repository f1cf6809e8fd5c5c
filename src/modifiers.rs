//! Per-read transformations, applied in a fixed order by the pipeline.
//!
//! Modifiers are tagged variants with no interior mutability: all counters
//! live in the caller's [`Statistics`], so workers can share one pipeline and
//! fold their own statistics.

use crate::{
    adapters::{is_better_match, Adapter, AdapterMatch, MatchSide},
    align::AlignScratch,
    adapters::index::PrefixIndex,
    seq::SeqRecord,
    stats::Statistics,
};
use std::{
    error::Error,
    fmt::{self, Display},
    sync::Arc,
};

/// What to do with a located adapter region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Trim,
    Retain,
    Mask,
    Lowercase,
    None,
}

/// Mutable per-call state threaded through the modifier chain.
pub struct ModContext<'a> {
    pub stats:   &'a mut Statistics,
    pub scratch: &'a mut AlignScratch,
    /// Statistics slot: 0 for R1/single-end, 1 for R2.
    pub side:    usize,
    /// The adapter list of this side, for name lookups.
    pub adapters: &'a [Adapter],
    /// Keep per-match read snapshots for the side files and rename
    /// templates.
    pub collect: bool,
}

/// One adapter occurrence observed while processing a read.
#[derive(Debug, Clone)]
pub struct MatchEvent {
    pub adapter_ix: usize,
    pub m:          AdapterMatch,
    /// Sequence and qualities of the read as it was when this match was
    /// found; captured only when side files or templates need it.
    pub seq:        Option<Vec<u8>>,
    pub qual:       Option<Vec<u8>>,
}

/// Everything later stages need to know about how a read was modified.
#[derive(Debug, Clone, Default)]
pub struct ReadInfo {
    pub matches:    Vec<MatchEvent>,
    pub is_trimmed: bool,
    pub rc:         bool,
    pub cut_prefix: Vec<u8>,
    pub cut_suffix: Vec<u8>,
}

impl ReadInfo {
    #[inline]
    pub fn clear(&mut self) {
        self.matches.clear();
        self.is_trimmed = false;
        self.rc = false;
        self.cut_prefix.clear();
        self.cut_suffix.clear();
    }

    /// Name of the adapter from the most recent match, if any.
    #[inline]
    pub fn adapter_name<'a>(&self, adapters: &'a [Adapter]) -> Option<&'a str> {
        self.matches
            .last()
            .map(|event| adapters[event.adapter_ix].name.as_str())
    }
}

/// The running-sum trimming boundary for both ends, per the BWA-style
/// algorithm: walk inward while the cumulative `cutoff - quality` stays
/// non-negative, and trim to the maximum.
pub fn quality_trim_index(qualities: &[u8], cutoff_front: u8, cutoff_back: u8, base: u8) -> (usize, usize) {
    let mut start = 0usize;
    let mut stop = qualities.len();

    if cutoff_front > 0 {
        let mut s = 0i64;
        let mut max_s = 0i64;
        for (i, &q) in qualities.iter().enumerate() {
            s += cutoff_front as i64 - (q.saturating_sub(base)) as i64;
            if s < 0 {
                break;
            }
            if s > max_s {
                max_s = s;
                start = i + 1;
            }
        }
    }

    if cutoff_back > 0 {
        let mut s = 0i64;
        let mut max_s = 0i64;
        for (i, &q) in qualities.iter().enumerate().rev() {
            s += cutoff_back as i64 - (q.saturating_sub(base)) as i64;
            if s < 0 {
                break;
            }
            if s > max_s {
                max_s = s;
                stop = i;
            }
        }
    }

    (start.min(stop), stop)
}

/// 3' boundary for two-color chemistry: `G` reads as quality zero, then the
/// standard running sum applies.
pub fn nextseq_trim_index(seq: &[u8], qualities: &[u8], cutoff: u8, base: u8) -> usize {
    let mut stop = qualities.len();
    let mut s = 0i64;
    let mut max_s = 0i64;
    for (i, (&b, &q)) in seq.iter().zip(qualities).enumerate().rev() {
        let q = if b == b'G' || b == b'g' {
            0
        } else {
            q.saturating_sub(base)
        };
        s += cutoff as i64 - q as i64;
        if s < 0 {
            break;
        }
        if s > max_s {
            max_s = s;
            stop = i;
        }
    }
    stop
}

/// Searches a read against an adapter list and applies the configured
/// action, up to `times` passes.
#[derive(Debug, Clone)]
pub struct AdapterCutter {
    pub adapters: Arc<Vec<Adapter>>,
    pub index:    Option<PrefixIndex>,
    pub times:    usize,
    pub action:   Action,
}

impl AdapterCutter {
    pub fn new(adapters: Arc<Vec<Adapter>>, times: usize, action: Action, allow_index: bool) -> Self {
        let index = allow_index.then(|| PrefixIndex::build(&adapters)).flatten();
        AdapterCutter {
            adapters,
            index,
            times,
            action,
        }
    }

    /// The best-scoring adapter match for `seq`, identical for the indexed
    /// and the brute-force paths.
    pub fn best_match(&self, seq: &[u8], scratch: &mut AlignScratch) -> Option<(usize, AdapterMatch)> {
        match self.index.as_ref().and_then(|ix| ix.candidates(seq)) {
            Some(candidates) => self.best_of(candidates.iter().copied(), seq, scratch),
            None => self.best_of(0..self.adapters.len(), seq, scratch),
        }
    }

    fn best_of(
        &self, candidates: impl Iterator<Item = usize>, seq: &[u8], scratch: &mut AlignScratch,
    ) -> Option<(usize, AdapterMatch)> {
        let mut best: Option<(usize, AdapterMatch)> = None;
        for ix in candidates {
            if let Some(m) = self.adapters[ix].find_match(seq, scratch) {
                if best.as_ref().is_none_or(|(_, cur)| is_better_match(&m, cur)) {
                    best = Some((ix, m));
                }
            }
        }
        best
    }

    fn record(&self, ix: usize, m: &AdapterMatch, read: &SeqRecord, info: &mut ReadInfo, ctx: &mut ModContext) {
        let removed = m.removed_range(read.len());
        let adapter = &self.adapters[ix];
        let astats = &mut ctx.stats.adapters[ctx.side][ix];
        astats
            .side_mut(m.side)
            .record(removed.len(), m.hit.aligned_len(), m.hit.errors);
        if adapter.track_wildcards {
            astats.wildcard_bases += adapter.wildcard_bases(&read.seq, m).len() as u64;
        }
        info.matches.push(MatchEvent {
            adapter_ix: ix,
            m:          *m,
            seq:        ctx.collect.then(|| read.seq.clone()),
            qual:       if ctx.collect { read.qual.clone() } else { None },
        });
        info.is_trimmed = true;
    }

    /// Repeatedly trims the best match; returns the total number of bases
    /// removed from the front and the number of matches.
    fn match_loop(&self, read: &mut SeqRecord, info: &mut ReadInfo, ctx: &mut ModContext) -> (usize, usize) {
        let mut front_total = 0usize;
        let mut found = 0usize;
        for _ in 0..self.times {
            let Some((ix, m)) = self.best_match(&read.seq, ctx.scratch) else {
                break;
            };
            self.record(ix, &m, read, info, ctx);
            match m.side {
                MatchSide::Front => {
                    front_total += m.hit.rend;
                    read.cut_front(m.hit.rend);
                }
                MatchSide::Back => read.truncate(m.hit.rstart),
            }
            found += 1;
        }
        (front_total, found)
    }

    /// Records and applies a single, already-located match.
    pub(crate) fn apply_one(
        &self, ix: usize, m: AdapterMatch, read: &mut SeqRecord, info: &mut ReadInfo, ctx: &mut ModContext,
    ) {
        self.record(ix, &m, read, info, ctx);
        let removed = m.removed_range(read.len());
        match self.action {
            Action::Trim => match m.side {
                MatchSide::Front => read.cut_front(m.hit.rend),
                MatchSide::Back => read.truncate(m.hit.rstart),
            },
            Action::Retain => match m.side {
                MatchSide::Front => read.cut_front(m.hit.rstart),
                MatchSide::Back => read.truncate(m.hit.rend),
            },
            Action::Mask => read.seq[removed].fill(b'N'),
            Action::Lowercase => read.seq[removed].make_ascii_lowercase(),
            Action::None => {}
        }
        ctx.stats.reads_with_adapters[ctx.side] += 1;
    }

    pub fn apply(&self, read: &mut SeqRecord, info: &mut ReadInfo, ctx: &mut ModContext) {
        match self.action {
            Action::Trim => {
                let (_, found) = self.match_loop(read, info, ctx);
                if found > 0 {
                    ctx.stats.reads_with_adapters[ctx.side] += 1;
                }
            }
            Action::Retain => {
                // Restricted to a single pass at construction time.
                if let Some((ix, m)) = self.best_match(&read.seq, ctx.scratch) {
                    self.apply_one(ix, m, read, info, ctx);
                }
            }
            Action::Mask | Action::Lowercase | Action::None => {
                // Find matches by trimming a working copy, then rewrite the
                // original: the kept bases form one contiguous window.
                let original_seq = read.seq.clone();
                let original_qual = read.qual.clone();
                let (front, found) = self.match_loop(read, info, ctx);
                let kept = read.seq.len();
                read.seq = original_seq;
                read.qual = original_qual;
                if found > 0 {
                    ctx.stats.reads_with_adapters[ctx.side] += 1;
                    match self.action {
                        Action::Mask => {
                            read.seq[..front].fill(b'N');
                            read.seq[front + kept..].fill(b'N');
                        }
                        Action::Lowercase => {
                            read.seq[..front].make_ascii_lowercase();
                            read.seq[front + kept..].make_ascii_lowercase();
                        }
                        _ => {}
                    }
                }
            }
        }
    }
}

/// R1 adapter `i` and R2 adapter `i` form a pair that is only removed when
/// both sides match.
#[derive(Debug, Clone)]
pub struct PairedAdapterCutter {
    pub cutter1: AdapterCutter,
    pub cutter2: AdapterCutter,
}

impl PairedAdapterCutter {
    pub fn apply_pair(
        &self, r1: &mut SeqRecord, r2: &mut SeqRecord, info1: &mut ReadInfo, info2: &mut ReadInfo,
        stats: &mut Statistics, scratch: &mut AlignScratch, collect: bool,
    ) {
        let Some((ix, m1)) = self.cutter1.best_match(&r1.seq, scratch) else {
            return;
        };
        let Some(m2) = self.cutter2.adapters[ix].find_match(&r2.seq, scratch) else {
            return;
        };
        let mut ctx1 = ModContext {
            stats: &mut *stats,
            scratch: &mut *scratch,
            side: 0,
            adapters: &self.cutter1.adapters,
            collect,
        };
        self.cutter1.apply_one(ix, m1, r1, info1, &mut ctx1);
        let mut ctx2 = ModContext {
            stats,
            scratch,
            side: 1,
            adapters: &self.cutter2.adapters,
            collect,
        };
        self.cutter2.apply_one(ix, m2, r2, info2, &mut ctx2);
    }
}

/// Probes both orientations of a read and keeps the better one.
#[derive(Debug, Clone)]
pub struct ReverseComplementer {
    pub cutter:    AdapterCutter,
    /// Appended to the read name when the reverse orientation wins; absent
    /// when a rename template is active.
    pub rc_suffix: Option<String>,
}

impl ReverseComplementer {
    pub fn apply(&self, read: &mut SeqRecord, info: &mut ReadInfo, ctx: &mut ModContext) {
        let forward = self.cutter.best_match(&read.seq, ctx.scratch);
        let rc_read = read.to_reverse_complement();
        let reverse = self.cutter.best_match(&rc_read.seq, ctx.scratch);

        let use_rc = match (&forward, &reverse) {
            (None, Some(_)) => true,
            (Some(f), Some(r)) => r.1.hit.matches > f.1.hit.matches,
            _ => false,
        };
        if use_rc {
            *read = rc_read;
            info.rc = true;
            ctx.stats.reverse_complemented += 1;
        }
        self.cutter.apply(read, info, ctx);
        if info.rc && let Some(suffix) = &self.rc_suffix {
            read.head.extend_from_slice(suffix.as_bytes());
        }
    }
}

/// A variable in a `--rename` template.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Var {
    Id,
    Header,
    Comment,
    AdapterName,
    MatchSequence,
    CutPrefix,
    CutSuffix,
    Rc,
}

#[derive(Debug, Clone)]
enum Part {
    Literal(String),
    /// A variable, optionally pinned to read 1 or 2 by an `_1`/`_2` suffix.
    Var(Var, Option<u8>),
}

/// An error in a `--rename` template, raised at construction.
#[derive(Debug)]
pub struct InvalidTemplate(pub String);

impl Display for InvalidTemplate {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "invalid rename template: {}", self.0)
    }
}

impl Error for InvalidTemplate {}

/// Rewrites read names from a template over a fixed variable set.
#[derive(Debug, Clone)]
pub struct Renamer {
    parts: Vec<Part>,
    /// Whether any part needs a match-time sequence snapshot.
    pub needs_snapshots: bool,
}

impl Renamer {
    /// Parses `template`; unknown variables and `_1`/`_2` suffixes on
    /// single-end data are construction-time errors.
    pub fn parse(template: &str, paired: bool) -> Result<Renamer, InvalidTemplate> {
        let mut parts = Vec::new();
        let mut literal = String::new();
        let mut rest = template;
        while let Some(open) = rest.find('{') {
            literal.push_str(&rest[..open]);
            let Some(close) = rest[open..].find('}') else {
                return Err(InvalidTemplate(format!("unclosed '{{' in '{template}'")));
            };
            let name = &rest[open + 1..open + close];
            let (base, side) = match name.strip_suffix("_1") {
                Some(base) => (base, Some(1)),
                None => match name.strip_suffix("_2") {
                    Some(base) => (base, Some(2)),
                    None => (name, None),
                },
            };
            if side.is_some() && !paired {
                return Err(InvalidTemplate(format!(
                    "'{{{name}}}' requires paired-end data"
                )));
            }
            let var = match base {
                "id" => Var::Id,
                "header" => Var::Header,
                "comment" => Var::Comment,
                "adapter_name" => Var::AdapterName,
                "match_sequence" => Var::MatchSequence,
                "cut_prefix" => Var::CutPrefix,
                "cut_suffix" => Var::CutSuffix,
                "rc" => Var::Rc,
                other => return Err(InvalidTemplate(format!("unknown variable '{{{other}}}'"))),
            };
            if !literal.is_empty() {
                parts.push(Part::Literal(std::mem::take(&mut literal)));
            }
            parts.push(Part::Var(var, side));
            rest = &rest[open + close + 1..];
        }
        literal.push_str(rest);
        if !literal.is_empty() {
            parts.push(Part::Literal(literal));
        }
        let needs_snapshots = parts
            .iter()
            .any(|p| matches!(p, Part::Var(Var::MatchSequence, _)));
        Ok(Renamer {
            parts,
            needs_snapshots,
        })
    }

    /// Renders the new name. Unsuffixed variables resolve from R1; the
    /// rendered name is applied to both reads of a pair.
    pub fn render(
        &self, r1: &SeqRecord, info1: &ReadInfo, adapters1: &[Adapter],
        r2: Option<(&SeqRecord, &ReadInfo, &[Adapter])>,
    ) -> Vec<u8> {
        let mut out = Vec::with_capacity(r1.head.len() + 16);
        for part in &self.parts {
            match part {
                Part::Literal(text) => out.extend_from_slice(text.as_bytes()),
                Part::Var(var, side) => {
                    let (read, info, adapters) = match side {
                        Some(2) => match r2 {
                            Some((read, info, adapters)) => (read, info, adapters),
                            None => continue,
                        },
                        _ => (r1, info1, adapters1),
                    };
                    match var {
                        Var::Id => out.extend_from_slice(read.id()),
                        Var::Header => out.extend_from_slice(&read.head),
                        Var::Comment => out.extend_from_slice(read.comment().unwrap_or_default()),
                        Var::AdapterName => {
                            out.extend_from_slice(info.adapter_name(adapters).unwrap_or("no_adapter").as_bytes())
                        }
                        Var::MatchSequence => {
                            if let Some(event) = info.matches.last()
                                && let Some(seq) = &event.seq
                            {
                                out.extend_from_slice(&seq[event.m.hit.rstart..event.m.hit.rend]);
                            }
                        }
                        Var::CutPrefix => out.extend_from_slice(&info.cut_prefix),
                        Var::CutSuffix => out.extend_from_slice(&info.cut_suffix),
                        Var::Rc => {
                            if info.rc {
                                out.extend_from_slice(b"rc");
                            }
                        }
                    }
                }
            }
        }
        out
    }
}

/// A single-read modifier, dispatched over its tag.
#[derive(Debug, Clone)]
pub enum SingleModifier {
    /// Remove a fixed number of bases: positive from the 5' end, negative
    /// from the 3' end.
    Cut(i32),
    NextseqTrim { cutoff: u8, base: u8 },
    QualityTrim { cutoff_front: u8, cutoff_back: u8, base: u8 },
    AdapterCut(AdapterCutter),
    ReverseComplement(ReverseComplementer),
    Shorten(i32),
    TrimN,
    LengthTag(Vec<u8>),
    StripSuffix(Vec<u8>),
    AddPrefixSuffix { prefix: String, suffix: String },
    ZeroCap { base: u8 },
    Rename(Renamer),
}

impl SingleModifier {
    pub fn apply(&self, read: &mut SeqRecord, info: &mut ReadInfo, ctx: &mut ModContext) {
        match self {
            SingleModifier::Cut(length) => {
                let n = length.unsigned_abs() as usize;
                if *length > 0 {
                    let n = n.min(read.len());
                    info.cut_prefix.extend_from_slice(&read.seq[..n]);
                    read.cut_front(n);
                } else if *length < 0 {
                    let keep = read.len().saturating_sub(n);
                    info.cut_suffix.extend_from_slice(&read.seq[keep..]);
                    read.truncate(keep);
                }
            }
            SingleModifier::NextseqTrim { cutoff, base } => {
                let stop = read
                    .qual
                    .as_ref()
                    .map(|qual| nextseq_trim_index(&read.seq, qual, *cutoff, *base));
                if let Some(stop) = stop {
                    ctx.stats.quality_trimmed_bp[ctx.side] += (read.len() - stop) as u64;
                    read.truncate(stop);
                }
            }
            SingleModifier::QualityTrim {
                cutoff_front,
                cutoff_back,
                base,
            } => {
                let bounds = read
                    .qual
                    .as_ref()
                    .map(|qual| quality_trim_index(qual, *cutoff_front, *cutoff_back, *base));
                if let Some((start, stop)) = bounds {
                    ctx.stats.quality_trimmed_bp[ctx.side] += (read.len() - (stop - start)) as u64;
                    read.truncate(stop);
                    read.cut_front(start);
                }
            }
            SingleModifier::AdapterCut(cutter) => cutter.apply(read, info, ctx),
            SingleModifier::ReverseComplement(rc) => rc.apply(read, info, ctx),
            SingleModifier::Shorten(length) => {
                let n = length.unsigned_abs() as usize;
                if *length >= 0 {
                    read.truncate(n);
                } else if read.len() > n {
                    read.cut_front(read.len() - n);
                }
            }
            SingleModifier::TrimN => {
                let end = read
                    .seq
                    .iter()
                    .rposition(|b| !b.eq_ignore_ascii_case(&b'N'))
                    .map_or(0, |p| p + 1);
                read.truncate(end);
                let start = read
                    .seq
                    .iter()
                    .position(|b| !b.eq_ignore_ascii_case(&b'N'))
                    .unwrap_or(read.len());
                read.cut_front(start);
            }
            SingleModifier::LengthTag(tag) => {
                if let Some(pos) = memchr::memmem::find(&read.head, tag) {
                    let digits_start = pos + tag.len();
                    let digits_end = read.head[digits_start..]
                        .iter()
                        .position(|b| !b.is_ascii_digit())
                        .map_or(read.head.len(), |p| digits_start + p);
                    let new = read.len().to_string();
                    read.head.splice(digits_start..digits_end, new.bytes());
                }
            }
            SingleModifier::StripSuffix(suffix) => {
                if read.head.ends_with(suffix) {
                    let keep = read.head.len() - suffix.len();
                    read.head.truncate(keep);
                }
            }
            SingleModifier::AddPrefixSuffix { prefix, suffix } => {
                let name = info.adapter_name(ctx.adapters).unwrap_or("no_adapter");
                let prefix = prefix.replace("{name}", name);
                let suffix = suffix.replace("{name}", name);
                if !prefix.is_empty() {
                    read.head.splice(0..0, prefix.bytes());
                }
                read.head.extend_from_slice(suffix.as_bytes());
            }
            SingleModifier::ZeroCap { base } => {
                if let Some(qual) = &mut read.qual {
                    for q in qual.iter_mut() {
                        if *q < *base {
                            *q = *base;
                        }
                    }
                }
            }
            SingleModifier::Rename(renamer) => {
                read.head = renamer.render(read, info, ctx.adapters, None);
            }
        }
    }
}

/// A pipeline step over a read pair. Single-end pipelines use only the
/// first slot of `Each`.
#[derive(Debug, Clone)]
pub enum PairedModifier {
    Each(Option<SingleModifier>, Option<SingleModifier>),
    PairedAdapterCut(PairedAdapterCutter),
    PairedRename(Renamer),
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::adapters::{parse_adapter_spec, AdapterDefaults, AdapterKind};

    fn read(seq: &[u8], qual: Option<&[u8]>) -> SeqRecord {
        SeqRecord::new(b"r1 comment".to_vec(), seq.to_vec(), qual.map(|q| q.to_vec()))
    }

    fn cutter(specs: &[(&str, AdapterKind)], action: Action, times: usize) -> AdapterCutter {
        let mut counter = 0;
        let defaults = AdapterDefaults::default();
        let adapters: Vec<_> = specs
            .iter()
            .flat_map(|(s, k)| parse_adapter_spec(s, *k, &defaults, &mut counter).unwrap())
            .collect();
        AdapterCutter::new(Arc::new(adapters), times, action, true)
    }

    struct Harness {
        stats:   Statistics,
        scratch: AlignScratch,
    }

    impl Harness {
        fn new(n1: usize, n2: usize) -> Self {
            Harness {
                stats:   Statistics::new(n1, n2),
                scratch: AlignScratch::default(),
            }
        }

        fn ctx<'a>(&'a mut self, adapters: &'a [Adapter]) -> ModContext<'a> {
            ModContext {
                stats: &mut self.stats,
                scratch: &mut self.scratch,
                side: 0,
                adapters,
                collect: true,
            }
        }
    }

    #[test]
    fn unconditional_cut_both_signs() {
        let mut h = Harness::new(0, 0);
        let mut info = ReadInfo::default();
        let mut r = read(b"AACCGGTT", Some(b"IIIIJJJJ"));

        SingleModifier::Cut(2).apply(&mut r, &mut info, &mut h.ctx(&[]));
        assert_eq!(r.seq, b"CCGGTT");
        assert_eq!(info.cut_prefix, b"AA");

        SingleModifier::Cut(-3).apply(&mut r, &mut info, &mut h.ctx(&[]));
        assert_eq!(r.seq, b"CCG");
        assert_eq!(info.cut_suffix, b"GTT");
        assert_eq!(r.qual.as_deref(), Some(&b"IIJ"[..]));
    }

    #[test]
    fn quality_trim_running_sum() {
        // Q40 Q40 Q5 Q5 with 3' cutoff 10 trims the last two bases.
        assert_eq!(quality_trim_index(&[73, 73, 38, 38], 0, 10, 33), (0, 2));
        // Front trimming mirrors it.
        assert_eq!(quality_trim_index(&[38, 38, 73, 73], 10, 0, 33), (2, 4));
        // A good base past a single bad one stops the trimming.
        assert_eq!(quality_trim_index(&[73, 73, 73, 38], 0, 10, 33), (0, 3));
    }

    #[test]
    fn quality_trim_modifier_counts_bases() {
        let mut h = Harness::new(0, 0);
        let mut info = ReadInfo::default();
        let mut r = read(b"ACGTAC", Some(b"IIII&&"));
        SingleModifier::QualityTrim {
            cutoff_front: 0,
            cutoff_back:  10,
            base:         33,
        }
        .apply(&mut r, &mut info, &mut h.ctx(&[]));
        assert_eq!(r.seq, b"ACGT");
        assert_eq!(h.stats.quality_trimmed_bp[0], 2);
    }

    #[test]
    fn nextseq_counts_g_as_zero() {
        let stop = nextseq_trim_index(b"ACGTGGGG", b"IIIIIIII", 20, 33);
        assert_eq!(stop, 4);
        // Dark-cycle Gs inside an otherwise good tail are still removed.
        let stop = nextseq_trim_index(b"ACGTGGTG", b"IIIIII!I", 20, 33);
        assert!(stop <= 6);
    }

    #[test]
    fn adapter_cutter_trims_best_match() {
        let cutter = cutter(&[("AAAATTTT", AdapterKind::Back)], Action::Trim, 1);
        let mut h = Harness::new(1, 0);
        let adapters = cutter.adapters.clone();
        let mut info = ReadInfo::default();
        let mut r = read(b"ACGTACGTAAAATTTT", Some(b"IIIIIIIIIIIIIIII"));
        cutter.apply(&mut r, &mut info, &mut h.ctx(&adapters));
        assert_eq!(r.seq, b"ACGTACGT");
        assert_eq!(r.qual.as_deref(), Some(&b"IIIIIIII"[..]));
        assert!(info.is_trimmed);
        assert_eq!(h.stats.adapters[0][0].count(), 1);
        assert_eq!(h.stats.reads_with_adapters[0], 1);
    }

    #[test]
    fn mask_action_keeps_length() {
        let cutter = cutter(&[("AAAATTTT", AdapterKind::Back)], Action::Mask, 1);
        let adapters = cutter.adapters.clone();
        let mut h = Harness::new(1, 0);
        let mut info = ReadInfo::default();
        let mut r = read(b"ACGTACGTAAAATTTT", Some(b"IIIIIIIIIIIIIIII"));
        cutter.apply(&mut r, &mut info, &mut h.ctx(&adapters));
        assert_eq!(r.seq, b"ACGTACGTNNNNNNNN");
        assert_eq!(r.qual.as_ref().unwrap().len(), 16);
        assert!(info.is_trimmed);
    }

    #[test]
    fn retain_action_keeps_adapter() {
        let cutter = cutter(&[("AAAA", AdapterKind::Back)], Action::Retain, 1);
        let adapters = cutter.adapters.clone();
        let mut h = Harness::new(1, 0);
        let mut info = ReadInfo::default();
        let mut r = read(b"CCGGAAAATTTT", None);
        cutter.apply(&mut r, &mut info, &mut h.ctx(&adapters));
        // The 3' adapter stays, the sequence after it goes.
        assert_eq!(r.seq, b"CCGGAAAA");
    }

    #[test]
    fn none_action_records_but_keeps_sequence() {
        let cutter = cutter(&[("AAAA", AdapterKind::Back)], Action::None, 1);
        let adapters = cutter.adapters.clone();
        let mut h = Harness::new(1, 0);
        let mut info = ReadInfo::default();
        let mut r = read(b"CCGGAAAA", None);
        cutter.apply(&mut r, &mut info, &mut h.ctx(&adapters));
        assert_eq!(r.seq, b"CCGGAAAA");
        assert!(info.is_trimmed);
        assert_eq!(h.stats.adapters[0][0].count(), 1);
    }

    #[test]
    fn paired_cutter_requires_both_sides() {
        let c1 = cutter(&[("AAA", AdapterKind::Back)], Action::Trim, 1);
        let c2 = cutter(&[("TTT", AdapterKind::Back)], Action::Trim, 1);
        let paired = PairedAdapterCutter {
            cutter1: c1,
            cutter2: c2,
        };
        let mut stats = Statistics::new(1, 1);
        let mut scratch = AlignScratch::default();

        let mut r1 = read(b"ACGTAAA", Some(b"IIIIIII"));
        let mut r2 = read(b"ACGTTTT", Some(b"IIIIIII"));
        let (mut i1, mut i2) = (ReadInfo::default(), ReadInfo::default());
        paired.apply_pair(&mut r1, &mut r2, &mut i1, &mut i2, &mut stats, &mut scratch, false);
        assert_eq!(r1.seq, b"ACGT");
        assert_eq!(r2.seq, b"ACGT");

        // R2 side missing: nothing is trimmed on either read.
        let mut r1 = read(b"ACGTAAA", Some(b"IIIIIII"));
        let mut r2 = read(b"ACGTCCC", Some(b"IIIIIII"));
        let (mut i1, mut i2) = (ReadInfo::default(), ReadInfo::default());
        paired.apply_pair(&mut r1, &mut r2, &mut i1, &mut i2, &mut stats, &mut scratch, false);
        assert_eq!(r1.seq, b"ACGTAAA");
        assert_eq!(r2.seq, b"ACGTCCC");
    }

    #[test]
    fn reverse_complementer_picks_better_orientation() {
        let c = cutter(&[("ACGTACGT", AdapterKind::Back)], Action::Trim, 1);
        let rc = ReverseComplementer {
            cutter:    c,
            rc_suffix: Some(" rc".to_string()),
        };
        let adapters = rc.cutter.adapters.clone();

        // Forward orientation already matches: kept as-is.
        let mut h = Harness::new(1, 0);
        let mut info = ReadInfo::default();
        let mut r = read(b"AAAACGTACGT", Some(b"IIIIIIIIIII"));
        rc.apply(&mut r, &mut info, &mut h.ctx(&adapters));
        assert!(!info.rc);
        assert_eq!(r.seq, b"AAA");
        assert!(!r.head.ends_with(b" rc"));

        // Adapter present only on the reverse complement strand.
        let c = cutter(&[("AAGGCC", AdapterKind::Back)], Action::Trim, 1);
        let rc = ReverseComplementer {
            cutter:    c,
            rc_suffix: Some(" rc".to_string()),
        };
        let adapters = rc.cutter.adapters.clone();
        let mut h = Harness::new(1, 0);
        let mut info = ReadInfo::default();
        let fwd = crate::seq::reverse_complement(b"ACGTAAGGCC");
        let mut r = SeqRecord::new(b"r2".to_vec(), fwd, None);
        rc.apply(&mut r, &mut info, &mut h.ctx(&adapters));
        assert!(info.rc);
        assert_eq!(r.seq, b"ACGT");
        assert!(r.head.ends_with(b" rc"));
        assert_eq!(h.stats.reverse_complemented, 1);
    }

    #[test]
    fn trim_n_and_shorten_and_zero_cap() {
        let mut h = Harness::new(0, 0);
        let mut info = ReadInfo::default();

        let mut r = read(b"NNACGTNN", Some(b"IIIIIIII"));
        SingleModifier::TrimN.apply(&mut r, &mut info, &mut h.ctx(&[]));
        assert_eq!(r.seq, b"ACGT");
        assert_eq!(r.qual.as_ref().unwrap().len(), 4);

        SingleModifier::Shorten(2).apply(&mut r, &mut info, &mut h.ctx(&[]));
        assert_eq!(r.seq, b"AC");
        let mut r = read(b"ACGTACGT", None);
        SingleModifier::Shorten(-3).apply(&mut r, &mut info, &mut h.ctx(&[]));
        assert_eq!(r.seq, b"CGT");

        let mut r = read(b"ACGT", Some(&[20, 40, 20, 40]));
        SingleModifier::ZeroCap { base: 33 }.apply(&mut r, &mut info, &mut h.ctx(&[]));
        assert_eq!(r.qual.as_deref(), Some(&[33, 40, 33, 40][..]));
    }

    #[test]
    fn length_tag_and_suffix_handling() {
        let mut h = Harness::new(0, 0);
        let mut info = ReadInfo::default();

        let mut r = SeqRecord::new(b"r1 length=150 x".to_vec(), b"ACGTAC".to_vec(), None);
        SingleModifier::LengthTag(b"length=".to_vec()).apply(&mut r, &mut info, &mut h.ctx(&[]));
        assert_eq!(r.head, b"r1 length=6 x");

        let mut r = SeqRecord::new(b"read_old".to_vec(), b"ACGT".to_vec(), None);
        SingleModifier::StripSuffix(b"_old".to_vec()).apply(&mut r, &mut info, &mut h.ctx(&[]));
        assert_eq!(r.head, b"read");

        let mut r = SeqRecord::new(b"read".to_vec(), b"ACGT".to_vec(), None);
        SingleModifier::AddPrefixSuffix {
            prefix: "pre_".to_string(),
            suffix: "_{name}".to_string(),
        }
        .apply(&mut r, &mut info, &mut h.ctx(&[]));
        assert_eq!(r.head, b"pre_read_no_adapter");
    }

    #[test]
    fn renamer_parses_and_renders() {
        assert!(Renamer::parse("{unknown_var}", false).is_err());
        assert!(Renamer::parse("{id_1}", false).is_err());
        assert!(Renamer::parse("{id", false).is_err());

        let cutter = cutter(&[("named=AAAA", AdapterKind::Back)], Action::Trim, 1);
        let adapters = cutter.adapters.clone();
        let mut h = Harness::new(1, 0);
        let mut info = ReadInfo::default();
        let mut r = read(b"ACGTAAAA", None);
        cutter.apply(&mut r, &mut info, &mut h.ctx(&adapters));

        let renamer = Renamer::parse("{id}|{adapter_name}|{match_sequence}|{rc}", false).unwrap();
        assert!(renamer.needs_snapshots);
        let name = renamer.render(&r, &info, &adapters, None);
        assert_eq!(name, b"r1|named|AAAA|");
    }

    #[test]
    fn renamer_paired_side_variables() {
        let renamer = Renamer::parse("{id}_{comment_2}", true).unwrap();
        let r1 = read(b"ACGT", None);
        let r2 = SeqRecord::new(b"r1 2:N:0".to_vec(), b"ACGT".to_vec(), None);
        let (i1, i2) = (ReadInfo::default(), ReadInfo::default());
        let name = renamer.render(&r1, &i1, &[], Some((&r2, &i2, &[])));
        assert_eq!(name, b"r1_2:N:0");
    }
}
