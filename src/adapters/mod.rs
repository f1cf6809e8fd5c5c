//! Adapter model: a pattern plus its placement constraints, compiled into a
//! [`Matcher`], along with the command-line and FASTA-file parsing that
//! produces adapter sets.

pub(crate) mod index;

use crate::{
    align::{AlignScratch, Hit, Matcher},
    seq::{is_iupac, is_wildcard},
};
use foldhash::{HashSet, HashSetExt};
use log::warn;
use std::{
    error::Error,
    fmt::{self, Display},
    path::{Path, PathBuf},
};

/// Where an adapter is expected relative to the read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// 3' adapter: everything from the match start onward is removed.
    Back,
    /// 5' adapter: everything up to the match end is removed.
    Front,
    /// Either end; classified per read by the match position.
    Anywhere,
}

/// Which end a concrete match was classified as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchSide {
    Front,
    Back,
}

/// A located adapter occurrence in a read.
#[derive(Debug, Clone, Copy)]
pub struct AdapterMatch {
    pub hit:  Hit,
    pub side: MatchSide,
}

impl AdapterMatch {
    /// The read region removed by a plain trim, given the read length.
    #[inline]
    pub fn removed_range(&self, read_len: usize) -> std::ops::Range<usize> {
        match self.side {
            MatchSide::Back => self.hit.rstart..read_len,
            MatchSide::Front => 0..self.hit.rend,
        }
    }
}

/// Defaults applied to every adapter of an invocation.
#[derive(Debug, Clone, Copy)]
pub struct AdapterDefaults {
    pub max_errors:        f64,
    pub min_overlap:       usize,
    pub allow_indels:      bool,
    pub read_wildcards:    bool,
    pub adapter_wildcards: bool,
}

impl Default for AdapterDefaults {
    #[inline]
    fn default() -> Self {
        Self {
            max_errors:        0.1,
            min_overlap:       3,
            allow_indels:      true,
            read_wildcards:    false,
            adapter_wildcards: true,
        }
    }
}

/// An adapter, immutable after construction.
#[derive(Debug, Clone)]
pub struct Adapter {
    pub name:      String,
    pub pattern:   Vec<u8>,
    pub placement: Placement,
    pub anchored:  bool,
    /// Whether wildcard positions in the pattern should be reported to the
    /// wildcard side file.
    pub track_wildcards: bool,
    matcher:       Matcher,
}

impl Adapter {
    fn new(
        name: String, pattern: Vec<u8>, placement: Placement, anchored: bool, defaults: &AdapterDefaults,
    ) -> Self {
        let has_wildcards = pattern.iter().any(|&b| is_wildcard(b));
        let all_n = pattern.iter().all(|&b| b.eq_ignore_ascii_case(&b'N'));
        let adapter_wildcards = defaults.adapter_wildcards && has_wildcards;
        let matcher = Matcher::new(
            &pattern,
            defaults.max_errors,
            defaults.min_overlap,
            defaults.allow_indels,
            adapter_wildcards,
            defaults.read_wildcards,
        );
        Adapter {
            name,
            track_wildcards: adapter_wildcards && !all_n,
            pattern,
            placement,
            anchored,
            matcher,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.pattern.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.pattern.is_empty()
    }

    #[inline]
    pub fn matcher(&self) -> &Matcher {
        &self.matcher
    }

    /// Finds the best occurrence of this adapter in `seq` under its
    /// placement constraints.
    pub fn find_match(&self, seq: &[u8], scratch: &mut AlignScratch) -> Option<AdapterMatch> {
        match self.placement {
            Placement::Back => self
                .matcher
                .locate_back(seq, self.anchored, scratch)
                .map(|hit| AdapterMatch {
                    hit,
                    side: MatchSide::Back,
                }),
            Placement::Front => self
                .matcher
                .locate_front(seq, self.anchored, scratch)
                .map(|hit| AdapterMatch {
                    hit,
                    side: MatchSide::Front,
                }),
            Placement::Anywhere => {
                let front = self.matcher.locate_front(seq, false, scratch);
                let back = self.matcher.locate_back(seq, false, scratch);
                let hit = match (front, back) {
                    (None, hit) | (hit, None) => hit?,
                    (Some(f), Some(b)) => {
                        // Longer alignment wins, then fewer errors; the 3'
                        // interpretation wins remaining ties.
                        if (f.aligned_len(), b.errors) > (b.aligned_len(), f.errors) {
                            f
                        } else {
                            b
                        }
                    }
                };
                let side = if hit.rstart == 0 {
                    MatchSide::Front
                } else {
                    MatchSide::Back
                };
                Some(AdapterMatch { hit, side })
            }
        }
    }

    /// Read bases aligned to wildcard positions of the pattern, zipping the
    /// matched regions position-wise (indels are ignored for this report).
    pub fn wildcard_bases(&self, seq: &[u8], m: &AdapterMatch) -> Vec<u8> {
        self.pattern[m.hit.astart..m.hit.aend]
            .iter()
            .zip(&seq[m.hit.rstart..m.hit.rend])
            .filter(|&(&p, _)| is_wildcard(p))
            .map(|(_, &s)| s)
            .collect()
    }
}

/// Ranks `candidate` against `current` across an adapter set: more aligned
/// matches first, then fewer errors, then the earlier adapter.
#[inline]
pub fn is_better_match(candidate: &AdapterMatch, current: &AdapterMatch) -> bool {
    (candidate.hit.matches, std::cmp::Reverse(candidate.hit.errors))
        > (current.hit.matches, std::cmp::Reverse(current.hit.errors))
}

/// The command-line flag family an adapter specification came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterKind {
    /// `-a` / `-A`
    Back,
    /// `-g` / `-G`
    Front,
    /// `-b` / `-B`
    Anywhere,
}

/// An error raised while turning adapter specifications into adapters.
#[derive(Debug)]
pub enum AdapterError {
    Empty,
    InvalidCharacter(char),
    BadAnchor(String),
    File(PathBuf, std::io::Error),
}

impl Display for AdapterError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AdapterError::Empty => write!(f, "adapter sequence is empty"),
            AdapterError::InvalidCharacter(c) => {
                write!(f, "invalid character '{c}' in adapter sequence (IUPAC codes only)")
            }
            AdapterError::BadAnchor(spec) => {
                write!(f, "anchoring in '{spec}' is not supported for this adapter type")
            }
            AdapterError::File(path, e) => write!(f, "cannot load adapters from {path:?}: {e}"),
        }
    }
}

impl Error for AdapterError {}

/// Parses one `-a`/`-g`/`-b` style specification (possibly `file:PATH`) into
/// one or more adapters. Unnamed adapters are numbered through `counter`.
///
/// ## Errors
///
/// Empty or non-IUPAC sequences, anchors that the kind does not support, and
/// unreadable adapter files are construction errors.
pub fn parse_adapter_spec(
    spec: &str, kind: AdapterKind, defaults: &AdapterDefaults, counter: &mut usize,
) -> Result<Vec<Adapter>, AdapterError> {
    if let Some(path) = spec.strip_prefix("file:") {
        return adapters_from_fasta(Path::new(path), kind, defaults, counter);
    }

    let (name, sequence) = match spec.split_once('=') {
        Some((name, seq)) if !name.is_empty() => (Some(name.to_string()), seq),
        _ => (None, spec),
    };
    let adapter = adapter_from_sequence(name, sequence, kind, defaults, counter)?;
    Ok(vec![adapter])
}

fn adapter_from_sequence(
    name: Option<String>, sequence: &str, kind: AdapterKind, defaults: &AdapterDefaults, counter: &mut usize,
) -> Result<Adapter, AdapterError> {
    let mut seq = sequence;
    let mut anchored = false;

    let placement = match kind {
        AdapterKind::Front => {
            if let Some(rest) = seq.strip_prefix('^') {
                anchored = true;
                seq = rest;
            }
            if seq.contains('$') || seq.contains('^') {
                return Err(AdapterError::BadAnchor(sequence.to_string()));
            }
            Placement::Front
        }
        AdapterKind::Back => {
            if let Some(rest) = seq.strip_suffix('$') {
                anchored = true;
                seq = rest;
            }
            if seq.contains('^') || seq.contains('$') {
                return Err(AdapterError::BadAnchor(sequence.to_string()));
            }
            Placement::Back
        }
        AdapterKind::Anywhere => {
            if seq.contains('^') || seq.contains('$') {
                return Err(AdapterError::BadAnchor(sequence.to_string()));
            }
            Placement::Anywhere
        }
    };

    if seq.is_empty() {
        return Err(AdapterError::Empty);
    }
    let pattern: Vec<u8> = seq.bytes().map(|b| b.to_ascii_uppercase()).collect();
    if let Some(&bad) = pattern.iter().find(|&&b| !is_iupac(b)) {
        return Err(AdapterError::InvalidCharacter(bad as char));
    }

    let name = name.unwrap_or_else(|| {
        *counter += 1;
        counter.to_string()
    });
    Ok(Adapter::new(name, pattern, placement, anchored, defaults))
}

/// Loads every record of a FASTA file as one adapter, eagerly. The record
/// identifier becomes the adapter name.
fn adapters_from_fasta(
    path: &Path, kind: AdapterKind, defaults: &AdapterDefaults, counter: &mut usize,
) -> Result<Vec<Adapter>, AdapterError> {
    use seq_io::fasta::Record;

    let source = crate::io::open_source(path).map_err(|e| AdapterError::File(path.to_path_buf(), e))?;
    let mut reader = seq_io::fasta::Reader::new(source);
    let mut adapters = Vec::new();
    while let Some(record) = reader.next() {
        let record = record.map_err(|e| AdapterError::File(path.to_path_buf(), std::io::Error::other(e)))?;
        let name = record
            .id()
            .ok()
            .filter(|id| !id.is_empty())
            .map(str::to_string);
        let sequence = String::from_utf8_lossy(&record.full_seq()).into_owned();
        adapters.push(adapter_from_sequence(name, &sequence, kind, defaults, counter)?);
    }
    Ok(adapters)
}

/// Warns (once per name) about duplicate adapter names; duplicates are legal
/// but make per-adapter reporting ambiguous.
pub fn warn_duplicate_adapters(adapters: &[Adapter]) {
    let mut seen = HashSet::new();
    for adapter in adapters {
        if !seen.insert(adapter.name.as_str()) {
            warn!(
                "adapter name '{}' is used more than once; reports and demultiplexing use the first",
                adapter.name
            );
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::align::AlignScratch;

    fn defaults() -> AdapterDefaults {
        AdapterDefaults::default()
    }

    #[test]
    fn parse_plain_and_named() {
        let mut counter = 0;
        let a = parse_adapter_spec("ACGT", AdapterKind::Back, &defaults(), &mut counter).unwrap();
        assert_eq!(a[0].name, "1");
        assert_eq!(a[0].pattern, b"ACGT");
        assert_eq!(a[0].placement, Placement::Back);
        assert!(!a[0].anchored);

        let b = parse_adapter_spec("adapt=acgtn", AdapterKind::Back, &defaults(), &mut counter).unwrap();
        assert_eq!(b[0].name, "adapt");
        assert_eq!(b[0].pattern, b"ACGTN");
    }

    #[test]
    fn parse_anchors() {
        let mut counter = 0;
        let g = parse_adapter_spec("^GGGG", AdapterKind::Front, &defaults(), &mut counter).unwrap();
        assert!(g[0].anchored);
        assert_eq!(g[0].placement, Placement::Front);

        let a = parse_adapter_spec("TTTT$", AdapterKind::Back, &defaults(), &mut counter).unwrap();
        assert!(a[0].anchored);
        assert_eq!(a[0].placement, Placement::Back);

        assert!(parse_adapter_spec("^AAAA", AdapterKind::Anywhere, &defaults(), &mut counter).is_err());
        assert!(parse_adapter_spec("AAAA$", AdapterKind::Front, &defaults(), &mut counter).is_err());
    }

    #[test]
    fn parse_rejects_bad_input() {
        let mut counter = 0;
        assert!(matches!(
            parse_adapter_spec("", AdapterKind::Back, &defaults(), &mut counter),
            Err(AdapterError::Empty)
        ));
        assert!(matches!(
            parse_adapter_spec("ACXGT", AdapterKind::Back, &defaults(), &mut counter),
            Err(AdapterError::InvalidCharacter('X'))
        ));
    }

    #[test]
    fn anywhere_classifies_by_position() {
        let mut counter = 0;
        let adapter = &parse_adapter_spec("AAAA", AdapterKind::Anywhere, &defaults(), &mut counter).unwrap()[0];
        let mut scratch = AlignScratch::default();

        let m = adapter.find_match(b"AAAACGTCGT", &mut scratch).unwrap();
        assert_eq!(m.side, MatchSide::Front);
        assert_eq!(m.removed_range(10), 0..4);

        let m = adapter.find_match(b"CGTCGTAAAA", &mut scratch).unwrap();
        assert_eq!(m.side, MatchSide::Back);
        assert_eq!(m.removed_range(10), 6..10);
    }

    #[test]
    fn wildcard_bases_reported() {
        let mut counter = 0;
        let adapter = &parse_adapter_spec("ANNA", AdapterKind::Back, &defaults(), &mut counter).unwrap()[0];
        assert!(adapter.track_wildcards);
        let mut scratch = AlignScratch::default();
        let m = adapter.find_match(b"CCCCACGA", &mut scratch).unwrap();
        assert_eq!(adapter.wildcard_bases(b"CCCCACGA", &m), b"CG");
    }

    #[test]
    fn n_only_pattern_not_tracked() {
        let mut counter = 0;
        let adapter = &parse_adapter_spec("NNNN", AdapterKind::Back, &defaults(), &mut counter).unwrap()[0];
        assert!(!adapter.track_wildcards);
    }
}
