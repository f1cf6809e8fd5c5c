//! Command-line surface and construction of the processing configuration.
//!
//! All contradictory or malformed options are rejected here, before any
//! input is opened; the CLI layer turns a [`UsageError`] into exit code 2.

use crate::{
    adapters::{parse_adapter_spec, warn_duplicate_adapters, Adapter, AdapterDefaults, AdapterError, AdapterKind},
    modifiers::{
        Action, AdapterCutter, InvalidTemplate, PairedAdapterCutter, PairedModifier, Renamer, ReverseComplementer,
        SingleModifier,
    },
    pipeline::{Filters, PairFilterMode, Pipeline},
    runner::{Demux, InputConfig, OutputLayout, Route, RunConfig},
};
use clap::{ArgAction, Parser, ValueEnum};
use foldhash::{HashMap, HashMapExt, HashSet, HashSetExt};
use std::{
    error::Error,
    fmt::{self, Display},
    sync::Arc,
};

#[derive(Parser, Debug)]
#[command(
    name = "readclip",
    version,
    about = "Trim adapter sequences from high-throughput sequencing reads",
    long_about = None
)]
pub struct Cli {
    /// Input file(s) in FASTQ or FASTA format (.gz/.xz/.bz2 supported);
    /// use '-' for standard input
    #[arg(value_name = "INPUT", required = true, num_args = 1..=2)]
    pub inputs: Vec<String>,

    /// 3' adapter to be removed from R1. Use `NAME=SEQ`, a trailing `$` to
    /// anchor, or `file:FILE` to load adapters from a FASTA file
    #[arg(short = 'a', long = "adapter", value_name = "ADAPTER", help_heading = "Finding adapters")]
    pub adapters: Vec<String>,

    /// 5' adapter for R1; prefix with `^` to anchor
    #[arg(short = 'g', long = "front", value_name = "ADAPTER", help_heading = "Finding adapters")]
    pub front: Vec<String>,

    /// Adapter that may be ligated to either end of R1
    #[arg(short = 'b', long = "anywhere", value_name = "ADAPTER", help_heading = "Finding adapters")]
    pub anywhere: Vec<String>,

    /// 3' adapter to be removed from R2
    #[arg(short = 'A', value_name = "ADAPTER", help_heading = "Finding adapters")]
    pub adapters2: Vec<String>,

    /// 5' adapter for R2
    #[arg(short = 'G', value_name = "ADAPTER", help_heading = "Finding adapters")]
    pub front2: Vec<String>,

    /// Adapter that may be ligated to either end of R2
    #[arg(short = 'B', value_name = "ADAPTER", help_heading = "Finding adapters")]
    pub anywhere2: Vec<String>,

    /// Maximum allowed errors: a rate when below 1, else an absolute count
    #[arg(short = 'e', long = "error-rate", value_name = "E", default_value_t = 0.1, help_heading = "Finding adapters")]
    pub error_rate: f64,

    /// Disallow insertions and deletions when matching adapters
    #[arg(long = "no-indels", help_heading = "Finding adapters")]
    pub no_indels: bool,

    /// Remove up to N adapters from each read
    #[arg(short = 'n', long = "times", value_name = "N", default_value_t = 1, help_heading = "Finding adapters")]
    pub times: usize,

    /// Minimum overlap between read and adapter for a match
    #[arg(short = 'O', long = "overlap", value_name = "LEN", default_value_t = 3, help_heading = "Finding adapters")]
    pub overlap: usize,

    /// Interpret IUPAC wildcards in reads
    #[arg(long = "match-read-wildcards", help_heading = "Finding adapters")]
    pub match_read_wildcards: bool,

    /// Do not interpret IUPAC wildcards in adapters
    #[arg(short = 'N', long = "no-match-adapter-wildcards", help_heading = "Finding adapters")]
    pub no_match_adapter_wildcards: bool,

    /// What to do when an adapter is found
    #[arg(long = "action", value_enum, value_name = "ACTION", default_value = "trim", help_heading = "Finding adapters")]
    pub action: ActionArg,

    /// Also search the reverse complement of each read (single-end only)
    #[arg(long = "rc", alias = "revcomp", help_heading = "Finding adapters")]
    pub revcomp: bool,

    /// Disable the adapter prefix index
    #[arg(long = "no-index", hide = true, help_heading = "Finding adapters")]
    pub no_index: bool,

    /// Remove LEN bases from R1: positive from the start, negative from the
    /// end; may be given twice with opposite signs
    #[arg(short = 'u', long = "cut", value_name = "LEN", allow_hyphen_values = true, help_heading = "Additional read modifications")]
    pub cut: Vec<i32>,

    /// Remove LEN bases from R2, like -u
    #[arg(short = 'U', value_name = "LEN", allow_hyphen_values = true, help_heading = "Additional read modifications")]
    pub cut2: Vec<i32>,

    /// Trim low-quality ends of R1: one 3' cutoff, or 5' and 3' separated
    /// by a comma
    #[arg(short = 'q', long = "quality-cutoff", value_name = "[5'CUTOFF,]3'CUTOFF", help_heading = "Additional read modifications")]
    pub quality_cutoff: Option<String>,

    /// Quality cutoff(s) for R2; defaults to the R1 cutoffs
    #[arg(short = 'Q', value_name = "[5'CUTOFF,]3'CUTOFF", help_heading = "Additional read modifications")]
    pub quality_cutoff2: Option<String>,

    /// Two-color-chemistry 3' quality trimming with dark-cycle Gs read as
    /// quality zero
    #[arg(long = "nextseq-trim", value_name = "3'CUTOFF", help_heading = "Additional read modifications")]
    pub nextseq_trim: Option<u8>,

    /// ASCII offset of the quality encoding (33 or 64)
    #[arg(long = "quality-base", value_name = "N", default_value_t = 33, help_heading = "Additional read modifications")]
    pub quality_base: u8,

    /// Shorten reads to LEN bases: positive keeps the start, negative the end
    #[arg(short = 'l', long = "length", value_name = "LEN", allow_hyphen_values = true, help_heading = "Additional read modifications")]
    pub length: Option<i32>,

    /// Trim N bases from the ends of each read
    #[arg(long = "trim-n", help_heading = "Additional read modifications")]
    pub trim_n: bool,

    /// Update the number after `TAG` in the header to the trimmed length
    #[arg(long = "length-tag", value_name = "TAG", help_heading = "Additional read modifications")]
    pub length_tag: Option<String>,

    /// Remove this suffix from read names; may be given multiple times
    #[arg(long = "strip-suffix", value_name = "SUFFIX", help_heading = "Additional read modifications")]
    pub strip_suffix: Vec<String>,

    /// Add this prefix to read names; `{name}` inserts the adapter name
    #[arg(short = 'x', long = "prefix", value_name = "PREFIX", default_value = "", help_heading = "Additional read modifications")]
    pub prefix: String,

    /// Add this suffix to read names; `{name}` inserts the adapter name
    #[arg(short = 'y', long = "suffix", value_name = "SUFFIX", default_value = "", help_heading = "Additional read modifications")]
    pub suffix: String,

    /// Rewrite read names from a template over {id}, {header}, {comment},
    /// {adapter_name}, {match_sequence}, {cut_prefix}, {cut_suffix}, {rc}
    #[arg(long = "rename", value_name = "TEMPLATE", help_heading = "Additional read modifications")]
    pub rename: Option<String>,

    /// Raise quality values below the quality base to the quality base
    #[arg(short = 'z', long = "zero-cap", help_heading = "Additional read modifications")]
    pub zero_cap: bool,

    /// Discard reads shorter than LEN (use LEN1:LEN2 for paired reads)
    #[arg(short = 'm', long = "minimum-length", value_name = "LEN[:LEN2]", help_heading = "Filtering of processed reads")]
    pub minimum_length: Option<String>,

    /// Discard reads longer than LEN (use LEN1:LEN2 for paired reads)
    #[arg(short = 'M', long = "maximum-length", value_name = "LEN[:LEN2]", help_heading = "Filtering of processed reads")]
    pub maximum_length: Option<String>,

    /// Discard reads with more than COUNT N bases (a fraction of the read
    /// length when between 0 and 1)
    #[arg(long = "max-n", value_name = "COUNT", help_heading = "Filtering of processed reads")]
    pub max_n: Option<f64>,

    /// Discard reads whose expected number of errors exceeds ERRORS
    #[arg(long = "max-expected-errors", alias = "max-ee", value_name = "ERRORS", help_heading = "Filtering of processed reads")]
    pub max_expected_errors: Option<f64>,

    /// Discard reads in which an adapter was found
    #[arg(long = "discard-trimmed", alias = "discard", help_heading = "Filtering of processed reads")]
    pub discard_trimmed: bool,

    /// Discard reads in which no adapter was found
    #[arg(long = "discard-untrimmed", alias = "trimmed-only", help_heading = "Filtering of processed reads")]
    pub discard_untrimmed: bool,

    /// Discard reads that failed the Illumina chastity filter
    #[arg(long = "discard-casava", help_heading = "Filtering of processed reads")]
    pub discard_casava: bool,

    /// Write trimmed reads to FILE rather than standard output. For
    /// demultiplexing, include `{name}` (or `{name1}`/`{name2}`)
    #[arg(short = 'o', long = "output", value_name = "FILE", help_heading = "Output")]
    pub output: Option<String>,

    /// Write R2 to FILE
    #[arg(short = 'p', long = "paired-output", value_name = "FILE", help_heading = "Output")]
    pub paired_output: Option<String>,

    /// Force FASTA output even for FASTQ input
    #[arg(long = "fasta", help_heading = "Output")]
    pub fasta: bool,

    /// Use fast (level 1) gzip compression for output files
    #[arg(short = 'Z', help_heading = "Output")]
    pub fast_compression: bool,

    #[arg(long = "compression-level", value_name = "N", default_value_t = 5, hide = true)]
    pub compression_level: u32,

    /// Write reads failing the minimum-length filter to FILE
    #[arg(long = "too-short-output", value_name = "FILE", help_heading = "Output")]
    pub too_short_output: Option<String>,

    /// Write R2 reads failing the minimum-length filter to FILE
    #[arg(long = "too-short-paired-output", value_name = "FILE", help_heading = "Output")]
    pub too_short_paired_output: Option<String>,

    /// Write reads failing the maximum-length filter to FILE
    #[arg(long = "too-long-output", value_name = "FILE", help_heading = "Output")]
    pub too_long_output: Option<String>,

    /// Write R2 reads failing the maximum-length filter to FILE
    #[arg(long = "too-long-paired-output", value_name = "FILE", help_heading = "Output")]
    pub too_long_paired_output: Option<String>,

    /// Write reads without any adapter match to FILE instead of discarding
    #[arg(long = "untrimmed-output", value_name = "FILE", help_heading = "Output")]
    pub untrimmed_output: Option<String>,

    /// Write R2 reads without any adapter match to FILE
    #[arg(long = "untrimmed-paired-output", value_name = "FILE", help_heading = "Output")]
    pub untrimmed_paired_output: Option<String>,

    /// Write one tab-separated line per adapter match to FILE
    #[arg(long = "info-file", value_name = "FILE", help_heading = "Output")]
    pub info_file: Option<String>,

    /// For each read with a 3' match, write the removed suffix and the read
    /// name to FILE
    #[arg(short = 'r', long = "rest-file", value_name = "FILE", help_heading = "Output")]
    pub rest_file: Option<String>,

    /// For each match of an adapter with wildcards, write the read bases at
    /// the wildcard positions to FILE
    #[arg(long = "wildcard-file", value_name = "FILE", help_heading = "Output")]
    pub wildcard_file: Option<String>,

    /// Treat R1 adapter i and R2 adapter i as a pair removed only when both
    /// match
    #[arg(long = "pair-adapters", help_heading = "Paired-end options")]
    pub pair_adapters: bool,

    /// Which reads of a pair must fail a filter for the pair to be dropped
    #[arg(long = "pair-filter", value_enum, value_name = "MODE", help_heading = "Paired-end options")]
    pub pair_filter: Option<PairFilterArg>,

    /// Read (and write) interleaved paired-end data
    #[arg(long = "interleaved", help_heading = "Paired-end options")]
    pub interleaved: bool,

    /// Number of worker cores; 0 auto-detects
    #[arg(short = 'j', long = "cores", value_name = "CORES", default_value_t = 1, allow_hyphen_values = true, help_heading = "Runtime")]
    pub cores: i32,

    /// Reader chunk size for multi-core processing, in bytes
    #[arg(long = "buffer-size", value_name = "BYTES", default_value_t = 4_000_000, hide = true)]
    pub buffer_size: usize,

    /// Print only error messages
    #[arg(long = "quiet", help_heading = "Runtime")]
    pub quiet: bool,

    /// Which report to print after processing
    #[arg(long = "report", value_enum, value_name = "KIND", help_heading = "Runtime")]
    pub report: Option<ReportArg>,

    /// Print debug output; repeat for more
    #[arg(long = "debug", action = ArgAction::Count, help_heading = "Runtime")]
    pub debug: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ActionArg {
    Trim,
    Retain,
    Mask,
    Lowercase,
    None,
}

impl ActionArg {
    fn to_action(self) -> Action {
        match self {
            ActionArg::Trim => Action::Trim,
            ActionArg::Retain => Action::Retain,
            ActionArg::Mask => Action::Mask,
            ActionArg::Lowercase => Action::Lowercase,
            ActionArg::None => Action::None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PairFilterArg {
    Any,
    Both,
    First,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ReportArg {
    Full,
    Minimal,
}

/// A user input error, reported on standard error with exit code 2.
#[derive(Debug)]
pub struct UsageError(pub String);

impl Display for UsageError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Error for UsageError {}

impl From<AdapterError> for UsageError {
    fn from(e: AdapterError) -> Self {
        UsageError(e.to_string())
    }
}

impl From<InvalidTemplate> for UsageError {
    fn from(e: InvalidTemplate) -> Self {
        UsageError(e.to_string())
    }
}

fn usage(message: impl Into<String>) -> UsageError {
    UsageError(message.into())
}

/// Everything the runner needs for one invocation.
pub struct Invocation {
    pub pipeline:   Pipeline,
    pub inputs:     InputConfig,
    pub layout:     OutputLayout,
    pub run_config: RunConfig,
}

/// Validates the parsed command line and builds the pipeline, the output
/// layout, and the runtime configuration.
///
/// ## Errors
///
/// Any contradictory, malformed, or unsupported option combination yields a
/// [`UsageError`].
pub fn build_invocation(args: &Cli) -> Result<Invocation, UsageError> {
    if args.cores < 0 {
        return Err(usage("the number of cores cannot be negative"));
    }
    let cores = if args.cores == 0 {
        num_cpus::get()
    } else {
        args.cores as usize
    };

    if args.quiet && args.report.is_some() {
        return Err(usage("options --quiet and --report cannot be used at the same time"));
    }
    if !(0.0..).contains(&args.error_rate) {
        return Err(usage("the maximum error rate cannot be negative"));
    }
    if args.times == 0 {
        return Err(usage("--times must be at least 1"));
    }

    let paired = args.inputs.len() == 2
        || args.paired_output.is_some()
        || args.interleaved
        || !args.adapters2.is_empty()
        || !args.front2.is_empty()
        || !args.anywhere2.is_empty()
        || !args.cut2.is_empty()
        || args.quality_cutoff2.is_some();
    let interleaved_input = args.interleaved && args.inputs.len() == 1;

    if paired && args.inputs.len() == 1 && !interleaved_input {
        return Err(usage("paired-end processing needs two input files (or --interleaved)"));
    }
    if !paired && args.paired_output.is_some() {
        return Err(usage("-p/--paired-output is only valid for paired-end data"));
    }

    validate_cuts(&args.cut)?;
    validate_cuts(&args.cut2)?;

    if args.pair_adapters && args.times != 1 {
        return Err(usage("--pair-adapters cannot be used with --times"));
    }
    if args.pair_adapters && args.revcomp {
        return Err(usage("--pair-adapters cannot be used with --rc"));
    }
    if args.revcomp && paired {
        return Err(usage("--rc is not supported for paired-end data"));
    }
    if args.rename.is_some() && (!args.prefix.is_empty() || !args.suffix.is_empty()) {
        return Err(usage("--rename cannot be combined with --prefix (-x) or --suffix (-y)"));
    }
    if args.action.to_action() == Action::Retain && args.times != 1 {
        return Err(usage("--action retain cannot be used with --times"));
    }
    if args.discard_untrimmed && args.untrimmed_output.is_some() {
        return Err(usage("--discard-untrimmed cannot be combined with --untrimmed-output"));
    }

    let defaults = AdapterDefaults {
        max_errors:        args.error_rate,
        min_overlap:       args.overlap,
        allow_indels:      !args.no_indels,
        read_wildcards:    args.match_read_wildcards,
        adapter_wildcards: !args.no_match_adapter_wildcards,
    };
    let adapters1 = Arc::new(parse_adapter_side(
        &args.adapters,
        &args.front,
        &args.anywhere,
        &defaults,
    )?);
    let adapters2 = Arc::new(parse_adapter_side(
        &args.adapters2,
        &args.front2,
        &args.anywhere2,
        &defaults,
    )?);
    warn_duplicate_adapters(&adapters1);
    warn_duplicate_adapters(&adapters2);

    if args.pair_adapters {
        if adapters1.is_empty() || adapters2.is_empty() {
            return Err(usage("--pair-adapters requires adapters for both reads"));
        }
        if adapters1.len() != adapters2.len() {
            return Err(usage("--pair-adapters requires the same number of adapters for R1 and R2"));
        }
    }

    let renamer = match args.rename.as_deref() {
        Some(template) if template != "{header}" => Some(Renamer::parse(template, paired)?),
        _ => None,
    };

    let steps = build_steps(args, paired, &adapters1, &adapters2, &renamer)?;

    let discard_untrimmed = args.discard_untrimmed
        || args.untrimmed_output.is_some()
        || args.untrimmed_paired_output.is_some();
    let filters = Filters {
        min_length: parse_length_pair(args.minimum_length.as_deref(), paired)?,
        max_length: parse_length_pair(args.maximum_length.as_deref(), paired)?,
        max_n: args.max_n,
        max_expected_errors: args.max_expected_errors,
        discard_casava: args.discard_casava,
        discard_trimmed: args.discard_trimmed,
        discard_untrimmed,
    };

    let pair_filter_mode = match args.pair_filter {
        Some(PairFilterArg::Any) | None => PairFilterMode::Any,
        Some(PairFilterArg::Both) => PairFilterMode::Both,
        Some(PairFilterArg::First) => PairFilterMode::First,
    };
    let override_untrimmed_pair_filter =
        paired && discard_untrimmed && (adapters1.is_empty() != adapters2.is_empty());

    let collect_snapshots = args.info_file.is_some()
        || args.rest_file.is_some()
        || args.wildcard_file.is_some()
        || renamer.as_ref().is_some_and(|r| r.needs_snapshots);

    let layout = build_layout(args, paired, &adapters1, &adapters2)?;

    let pipeline = Pipeline {
        steps,
        filters,
        pair_filter_mode,
        override_untrimmed_pair_filter,
        adapters1,
        adapters2,
        quality_base: args.quality_base,
        collect_snapshots,
        paired,
    };

    Ok(Invocation {
        pipeline,
        inputs: InputConfig {
            path1: args.inputs[0].clone(),
            path2: args.inputs.get(1).cloned(),
            interleaved: interleaved_input,
        },
        layout,
        run_config: RunConfig {
            cores,
            buffer_size: args.buffer_size,
            compression_level: if args.fast_compression { 1 } else { args.compression_level },
        },
    })
}

fn validate_cuts(cuts: &[i32]) -> Result<(), UsageError> {
    if cuts.len() > 2 {
        return Err(usage("you cannot remove bases from more than two ends"));
    }
    if cuts.len() == 2 && cuts[0] * cuts[1] > 0 {
        return Err(usage("you cannot remove bases from the same end twice"));
    }
    Ok(())
}

fn parse_adapter_side(
    back: &[String], front: &[String], anywhere: &[String], defaults: &AdapterDefaults,
) -> Result<Vec<Adapter>, UsageError> {
    let mut counter = 0;
    let mut list = Vec::new();
    for (specs, kind) in [
        (back, AdapterKind::Back),
        (front, AdapterKind::Front),
        (anywhere, AdapterKind::Anywhere),
    ] {
        for spec in specs {
            list.extend(parse_adapter_spec(spec, kind, defaults, &mut counter)?);
        }
    }
    Ok(list)
}

/// Parses `INT[,INT]` quality cutoffs: one value is a 3' cutoff, two are
/// 5' and 3'.
fn parse_cutoffs(s: &str) -> Result<(u8, u8), UsageError> {
    let parse = |v: &str| {
        v.parse::<u8>()
            .map_err(|_| usage(format!("quality cutoff value not recognized: '{v}'")))
    };
    match s.split_once(',') {
        None => Ok((0, parse(s)?)),
        Some((front, back)) => {
            if back.contains(',') {
                return Err(usage("expected one value or two values separated by comma for the quality cutoff"));
            }
            Ok((parse(front)?, parse(back)?))
        }
    }
}

/// Parses `LEN[:LEN2]` length bounds; either side of the colon may be
/// empty. A single value applies to both reads.
fn parse_length_pair(s: Option<&str>, paired: bool) -> Result<[Option<usize>; 2], UsageError> {
    let Some(s) = s else {
        return Ok([None, None]);
    };
    let parse = |v: &str| -> Result<Option<usize>, UsageError> {
        if v.is_empty() {
            return Ok(None);
        }
        v.parse::<usize>()
            .map(Some)
            .map_err(|_| usage(format!("length value not recognized: '{v}'")))
    };
    match s.split_once(':') {
        None => {
            let value = parse(s)?;
            Ok([value, if paired { value } else { None }])
        }
        Some(_) if !paired => Err(usage("two length values are only possible for paired-end data")),
        Some((first, second)) => Ok([parse(first)?, parse(second)?]),
    }
}

/// Assembles the modifier chain in its fixed order: cutters, NextSeq
/// trimming, quality trimming, adapter cutting, post-trim modifiers, and
/// finally the renamer.
fn build_steps(
    args: &Cli, paired: bool, adapters1: &Arc<Vec<Adapter>>, adapters2: &Arc<Vec<Adapter>>,
    renamer: &Option<Renamer>,
) -> Result<Vec<PairedModifier>, UsageError> {
    let mut steps = Vec::new();

    for &cut in &args.cut {
        if cut != 0 {
            steps.push(PairedModifier::Each(Some(SingleModifier::Cut(cut)), None));
        }
    }
    for &cut in &args.cut2 {
        if cut != 0 {
            steps.push(PairedModifier::Each(None, Some(SingleModifier::Cut(cut))));
        }
    }

    if let Some(cutoff) = args.nextseq_trim {
        let trimmer = SingleModifier::NextseqTrim {
            cutoff,
            base: args.quality_base,
        };
        steps.push(PairedModifier::Each(
            Some(trimmer.clone()),
            paired.then_some(trimmer),
        ));
    }

    let qtrim1 = args.quality_cutoff.as_deref().map(parse_cutoffs).transpose()?;
    let qtrim2 = args.quality_cutoff2.as_deref().map(parse_cutoffs).transpose()?;
    if qtrim1.is_some() || qtrim2.is_some() {
        let to_modifier = |cutoffs: (u8, u8)| SingleModifier::QualityTrim {
            cutoff_front: cutoffs.0,
            cutoff_back:  cutoffs.1,
            base:         args.quality_base,
        };
        // Without -Q, the R1 cutoffs also apply to R2.
        let m2 = qtrim2.or(if paired { qtrim1 } else { None }).map(to_modifier);
        steps.push(PairedModifier::Each(qtrim1.map(to_modifier), m2));
    }

    let action = args.action.to_action();
    let allow_index = !args.no_index;
    if args.pair_adapters {
        steps.push(PairedModifier::PairedAdapterCut(PairedAdapterCutter {
            cutter1: AdapterCutter::new(adapters1.clone(), 1, action, allow_index),
            cutter2: AdapterCutter::new(adapters2.clone(), 1, action, allow_index),
        }));
    } else {
        let cutter1 = (!adapters1.is_empty())
            .then(|| AdapterCutter::new(adapters1.clone(), args.times, action, allow_index));
        let cutter2 = (!adapters2.is_empty())
            .then(|| AdapterCutter::new(adapters2.clone(), args.times, action, allow_index));
        if args.revcomp {
            if let Some(cutter) = cutter1 {
                steps.push(PairedModifier::Each(
                    Some(SingleModifier::ReverseComplement(ReverseComplementer {
                        cutter,
                        rc_suffix: args.rename.is_none().then(|| " rc".to_string()),
                    })),
                    None,
                ));
            }
        } else if cutter1.is_some() || cutter2.is_some() {
            steps.push(PairedModifier::Each(
                cutter1.map(SingleModifier::AdapterCut),
                cutter2.map(SingleModifier::AdapterCut),
            ));
        }
    }

    let mut both_ends = Vec::new();
    if let Some(length) = args.length {
        both_ends.push(SingleModifier::Shorten(length));
    }
    if args.trim_n {
        both_ends.push(SingleModifier::TrimN);
    }
    if let Some(tag) = &args.length_tag {
        both_ends.push(SingleModifier::LengthTag(tag.clone().into_bytes()));
    }
    for suffix in &args.strip_suffix {
        both_ends.push(SingleModifier::StripSuffix(suffix.clone().into_bytes()));
    }
    if !args.prefix.is_empty() || !args.suffix.is_empty() {
        both_ends.push(SingleModifier::AddPrefixSuffix {
            prefix: args.prefix.clone(),
            suffix: args.suffix.clone(),
        });
    }
    if args.zero_cap {
        both_ends.push(SingleModifier::ZeroCap {
            base: args.quality_base,
        });
    }
    for modifier in both_ends {
        steps.push(PairedModifier::Each(
            Some(modifier.clone()),
            paired.then_some(modifier),
        ));
    }

    if let Some(renamer) = renamer {
        if paired {
            steps.push(PairedModifier::PairedRename(renamer.clone()));
        } else {
            steps.push(PairedModifier::Each(Some(SingleModifier::Rename(renamer.clone())), None));
        }
    }

    Ok(steps)
}

/// Builds the output slots and routing, including demultiplexing maps.
fn build_layout(
    args: &Cli, paired: bool, adapters1: &[Adapter], adapters2: &[Adapter],
) -> Result<OutputLayout, UsageError> {
    let mut slots: Vec<String> = Vec::new();
    let add_slot = |slots: &mut Vec<String>, path: String| -> usize {
        slots.push(path);
        slots.len() - 1
    };

    let interleaved_output = paired && args.paired_output.is_none();
    let out_template = args.output.as_deref();
    let combinatorial = out_template.is_some_and(|o| o.contains("{name1}") || o.contains("{name2}"));
    let demux_normal = !combinatorial && out_template.is_some_and(|o| o.contains("{name}"));

    let mut demux = None;
    let main;

    if combinatorial {
        if !paired {
            return Err(usage("combinatorial demultiplexing requires paired-end data"));
        }
        let (Some(out1), Some(out2)) = (args.output.as_deref(), args.paired_output.as_deref()) else {
            return Err(usage("combinatorial demultiplexing requires both -o and -p"));
        };
        for template in [out1, out2] {
            if !(template.contains("{name1}") && template.contains("{name2}")) {
                return Err(usage("combinatorial demultiplexing requires {name1} and {name2} in both -o and -p"));
            }
        }
        let names1 = adapter_names(adapters1);
        let names2 = adapter_names(adapters2);
        let mut by_name = HashMap::new();
        for name1 in names1.iter().map(String::as_str).chain(["unknown"]) {
            for name2 in names2.iter().map(String::as_str).chain(["unknown"]) {
                let path1 = out1.replace("{name1}", name1).replace("{name2}", name2);
                let path2 = out2.replace("{name1}", name1).replace("{name2}", name2);
                let slot1 = add_slot(&mut slots, path1);
                let slot2 = add_slot(&mut slots, path2);
                by_name.insert((name1.to_string(), name2.to_string()), Route::Pair(slot1, slot2));
            }
        }
        demux = Some(Demux {
            combinatorial: true,
            by_name,
            unknown: Route::Drop,
        });
        main = Route::Drop;
    } else if demux_normal {
        let out1 = out_template.expect("demultiplexing requires -o");
        if paired {
            let Some(out2) = args.paired_output.as_deref() else {
                return Err(usage("paired-end demultiplexing requires -p with {name}"));
            };
            if !out2.contains("{name}") {
                return Err(usage("paired-end demultiplexing requires {name} in -p as well"));
            }
            let mut by_name = HashMap::new();
            for name in adapter_names(adapters1) {
                let slot1 = add_slot(&mut slots, out1.replace("{name}", &name));
                let slot2 = add_slot(&mut slots, out2.replace("{name}", &name));
                by_name.insert((name, String::new()), Route::Pair(slot1, slot2));
            }
            let unknown1 = args
                .untrimmed_output
                .clone()
                .unwrap_or_else(|| out1.replace("{name}", "unknown"));
            let unknown2 = args
                .untrimmed_paired_output
                .clone()
                .unwrap_or_else(|| out2.replace("{name}", "unknown"));
            let slot1 = add_slot(&mut slots, unknown1);
            let slot2 = add_slot(&mut slots, unknown2);
            demux = Some(Demux {
                combinatorial: false,
                by_name,
                unknown: Route::Pair(slot1, slot2),
            });
        } else {
            let mut by_name = HashMap::new();
            for name in adapter_names(adapters1) {
                let slot = add_slot(&mut slots, out1.replace("{name}", &name));
                by_name.insert((name, String::new()), Route::Single(slot));
            }
            let unknown = args
                .untrimmed_output
                .clone()
                .unwrap_or_else(|| out1.replace("{name}", "unknown"));
            let slot = add_slot(&mut slots, unknown);
            demux = Some(Demux {
                combinatorial: false,
                by_name,
                unknown: Route::Single(slot),
            });
        }
        main = Route::Drop;
    } else if paired {
        match (args.output.as_deref(), args.paired_output.as_deref()) {
            (Some(out1), Some(out2)) => {
                let slot1 = add_slot(&mut slots, out1.to_string());
                let slot2 = add_slot(&mut slots, out2.to_string());
                main = Route::Pair(slot1, slot2);
            }
            (Some(out1), None) if args.interleaved => {
                main = Route::Interleaved(add_slot(&mut slots, out1.to_string()));
            }
            (None, None) if args.interleaved => {
                main = Route::Interleaved(add_slot(&mut slots, "-".to_string()));
            }
            (Some(_), None) => {
                return Err(usage("paired-end data needs -p (or --interleaved) in addition to -o"));
            }
            (None, _) => {
                return Err(usage("paired-end data needs -o and -p (or --interleaved)"));
            }
        }
    } else {
        let path = args.output.clone().unwrap_or_else(|| "-".to_string());
        main = Route::Single(add_slot(&mut slots, path));
    }

    let side_route = |slots: &mut Vec<String>,
                      first: &Option<String>,
                      second: &Option<String>,
                      what: &str|
     -> Result<Route, UsageError> {
        match (first, second) {
            (None, None) => Ok(Route::Drop),
            (Some(path1), Some(path2)) if paired => {
                let slot1 = add_slot(slots, path1.clone());
                let slot2 = add_slot(slots, path2.clone());
                Ok(Route::Pair(slot1, slot2))
            }
            (Some(path1), None) if paired && interleaved_output => {
                Ok(Route::Interleaved(add_slot(slots, path1.clone())))
            }
            (Some(path1), None) if !paired => Ok(Route::Single(add_slot(slots, path1.clone()))),
            _ => Err(usage(format!(
                "{what} output needs both the R1 and R2 variants for paired-end data"
            ))),
        }
    };

    let too_short = side_route(
        &mut slots,
        &args.too_short_output,
        &args.too_short_paired_output,
        "too-short",
    )?;
    let too_long = side_route(
        &mut slots,
        &args.too_long_output,
        &args.too_long_paired_output,
        "too-long",
    )?;
    let untrimmed = match &demux {
        // Unmatched reads go to the demultiplexing unknown bin, whatever
        // the verdict that sent them there.
        Some(demux) => demux.unknown,
        None => side_route(
            &mut slots,
            &args.untrimmed_output,
            &args.untrimmed_paired_output,
            "untrimmed",
        )?,
    };

    let info = args.info_file.clone().map(|p| add_slot(&mut slots, p));
    let rest = args.rest_file.clone().map(|p| add_slot(&mut slots, p));
    let wildcard = args.wildcard_file.clone().map(|p| add_slot(&mut slots, p));

    Ok(OutputLayout {
        slots,
        main,
        demux,
        too_short,
        too_long,
        untrimmed,
        info,
        rest,
        wildcard,
        force_fasta: args.fasta,
    })
}

/// Adapter names in order, first occurrence wins.
fn adapter_names(adapters: &[Adapter]) -> Vec<String> {
    let mut seen = HashSet::new();
    adapters
        .iter()
        .filter(|a| seen.insert(a.name.as_str()))
        .map(|a| a.name.clone())
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;

    fn cli(argv: &[&str]) -> Cli {
        Cli::parse_from(std::iter::once("readclip").chain(argv.iter().copied()))
    }

    #[test]
    fn cutoff_parsing() {
        assert_eq!(parse_cutoffs("5").unwrap(), (0, 5));
        assert_eq!(parse_cutoffs("6,7").unwrap(), (6, 7));
        assert!(parse_cutoffs("a").is_err());
        assert!(parse_cutoffs("1,2,3").is_err());
    }

    #[test]
    fn length_pair_parsing() {
        assert_eq!(parse_length_pair(Some("10"), false).unwrap(), [Some(10), None]);
        assert_eq!(parse_length_pair(Some("10"), true).unwrap(), [Some(10), Some(10)]);
        assert_eq!(parse_length_pair(Some("10:20"), true).unwrap(), [Some(10), Some(20)]);
        assert_eq!(parse_length_pair(Some(":20"), true).unwrap(), [None, Some(20)]);
        assert!(parse_length_pair(Some("10:20"), false).is_err());
        assert!(parse_length_pair(Some("x"), true).is_err());
    }

    #[test]
    fn cut_validation() {
        assert!(validate_cuts(&[5]).is_ok());
        assert!(validate_cuts(&[5, -3]).is_ok());
        assert!(validate_cuts(&[5, 3]).is_err());
        assert!(validate_cuts(&[-5, -3]).is_err());
        assert!(validate_cuts(&[1, 2, 3]).is_err());
    }

    #[test]
    fn single_end_invocation() {
        let args = cli(&["-a", "AGATCGGAAGAGC", "-q", "20", "-m", "20", "in.fastq"]);
        let invocation = build_invocation(&args).unwrap();
        assert!(!invocation.pipeline.paired);
        assert_eq!(invocation.pipeline.filters.min_length, [Some(20), None]);
        assert_eq!(invocation.pipeline.adapters1.len(), 1);
        // Quality trimming comes before adapter cutting.
        assert_eq!(invocation.pipeline.steps.len(), 2);
        assert_eq!(invocation.layout.main, Route::Single(0));
    }

    #[test]
    fn paired_invocation_needs_outputs() {
        let args = cli(&["-a", "ACGT", "-A", "TTTT", "-o", "out1.fastq", "in1.fastq", "in2.fastq"]);
        assert!(build_invocation(&args).is_err());

        let args = cli(&[
            "-a", "ACGT", "-A", "TTTT", "-o", "out1.fastq", "-p", "out2.fastq", "in1.fastq", "in2.fastq",
        ]);
        let invocation = build_invocation(&args).unwrap();
        assert!(invocation.pipeline.paired);
        assert_eq!(invocation.layout.main, Route::Pair(0, 1));
    }

    #[test]
    fn contradictory_options_are_rejected() {
        for argv in [
            &["--pair-adapters", "-n", "2", "-a", "A", "-A", "T", "-o", "o", "-p", "p", "a.fq", "b.fq"][..],
            &["--pair-adapters", "--rc", "-a", "A", "-A", "T", "-o", "o", "-p", "p", "a.fq", "b.fq"],
            &["--rename", "{id}", "-x", "pre", "-a", "ACGT", "in.fq"],
            &["--quiet", "--report", "minimal", "-a", "ACGT", "in.fq"],
            &["-j", "-2", "-a", "ACGT", "in.fq"],
            &["-u", "3", "-u", "4", "-a", "ACGT", "in.fq"],
            &["--discard-untrimmed", "--untrimmed-output", "u.fq", "-a", "ACGT", "in.fq"],
            &["--rc", "-a", "ACGT", "-A", "TTTT", "-o", "o", "-p", "p", "a.fq", "b.fq"],
        ] {
            let args = cli(argv);
            assert!(build_invocation(&args).is_err(), "expected rejection: {argv:?}");
        }
    }

    #[test]
    fn pair_adapters_requires_matched_lists() {
        let args = cli(&["--pair-adapters", "-a", "ACGT", "-o", "o", "-p", "p", "a.fq", "b.fq"]);
        assert!(build_invocation(&args).is_err());
    }

    #[test]
    fn demultiplex_layout() {
        let args = cli(&["-a", "A=AAAA", "-a", "B=CCCC", "-o", "out_{name}.fq", "in.fq"]);
        let invocation = build_invocation(&args).unwrap();
        let layout = invocation.layout;
        assert_eq!(
            layout.slots,
            vec!["out_A.fq", "out_B.fq", "out_unknown.fq"]
        );
        let demux = layout.demux.unwrap();
        assert!(!demux.combinatorial);
        assert_eq!(demux.unknown, Route::Single(2));
    }

    #[test]
    fn combinatorial_layout() {
        let args = cli(&[
            "-a", "A=AAAA", "-A", "X=GGGG", "-o", "out_{name1}_{name2}.fq", "-p", "p_{name1}_{name2}.fq",
            "in1.fq", "in2.fq",
        ]);
        let invocation = build_invocation(&args).unwrap();
        let demux = invocation.layout.demux.unwrap();
        assert!(demux.combinatorial);
        // 2x2 combinations including unknowns.
        assert_eq!(demux.by_name.len(), 4);
        assert_eq!(invocation.layout.slots.len(), 8);
        assert!(invocation
            .layout
            .slots
            .contains(&"out_A_unknown.fq".to_string()));
    }

    #[test]
    fn untrimmed_override_only_with_one_sided_adapters() {
        let args = cli(&[
            "-a", "ACGT", "--discard-untrimmed", "-o", "o.fq", "-p", "p.fq", "a.fq", "b.fq",
        ]);
        let invocation = build_invocation(&args).unwrap();
        assert!(invocation.pipeline.override_untrimmed_pair_filter);

        let args = cli(&[
            "-a", "ACGT", "-A", "TTTT", "--discard-untrimmed", "-o", "o.fq", "-p", "p.fq", "a.fq", "b.fq",
        ]);
        let invocation = build_invocation(&args).unwrap();
        assert!(!invocation.pipeline.override_untrimmed_pair_filter);
    }

    #[test]
    fn interleaved_modes() {
        let args = cli(&["-a", "ACGT", "--interleaved", "in.fq"]);
        let invocation = build_invocation(&args).unwrap();
        assert!(invocation.inputs.interleaved);
        assert_eq!(invocation.layout.main, Route::Interleaved(0));

        // Two files in, interleaved out.
        let args = cli(&["-a", "ACGT", "--interleaved", "-o", "out.fq", "a.fq", "b.fq"]);
        let invocation = build_invocation(&args).unwrap();
        assert!(!invocation.inputs.interleaved);
        assert_eq!(invocation.layout.main, Route::Interleaved(0));
    }
}
