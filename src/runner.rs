//! Serial and parallel execution of a pipeline over the input streams.
//!
//! The parallel topology is one reader thread cutting record-aligned chunks,
//! a pool of workers each running the shared pipeline over its chunk with
//! private statistics, and one writer thread that commits worker results in
//! strict chunk order. Queues are bounded in both directions, so the reader
//! stalls when workers fall behind and workers stall when the writer does.

use crate::{
    adapters::{Adapter, MatchSide},
    align::AlignScratch,
    io::{
        chunks::ChunkReader,
        create_output,
        fastx::{parse_chunk, FastXReader, Format},
        open_input, OutputWriter,
    },
    modifiers::ReadInfo,
    pipeline::{Pipeline, Verdict},
    seq::SeqRecord,
    stats::Statistics,
};
use crossbeam_channel::bounded;
use foldhash::{HashMap, HashMapExt};
use std::io::{Error, ErrorKind, Write};

/// Where a routed record lands: nowhere, one sink, two sinks, or both
/// records interleaved into one sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Drop,
    Single(usize),
    Pair(usize, usize),
    Interleaved(usize),
}

/// Demultiplex routing by matched adapter name(s).
#[derive(Debug)]
pub struct Demux {
    pub combinatorial: bool,
    /// Keyed by `(name1, name2)`; plain demultiplexing uses an empty second
    /// name.
    pub by_name: HashMap<(String, String), Route>,
    pub unknown: Route,
}

impl Demux {
    fn route(&self, name1: Option<&str>, name2: Option<&str>) -> Route {
        let key = if self.combinatorial {
            (
                name1.unwrap_or("unknown").to_string(),
                name2.unwrap_or("unknown").to_string(),
            )
        } else {
            match name1 {
                Some(name) => (name.to_string(), String::new()),
                None => return self.unknown,
            }
        };
        self.by_name.get(&key).copied().unwrap_or(self.unknown)
    }
}

/// The full output plan: one slot per physical file plus the routing from
/// verdicts (and adapter names) to slots. Built once at startup, shared
/// read-only by workers; only the writer owns the actual file handles.
#[derive(Debug)]
pub struct OutputLayout {
    /// Output path per slot; `-` is standard output.
    pub slots: Vec<String>,
    pub main: Route,
    pub demux: Option<Demux>,
    pub too_short: Route,
    pub too_long: Route,
    pub untrimmed: Route,
    pub info: Option<usize>,
    pub rest: Option<usize>,
    pub wildcard: Option<usize>,
    /// Force FASTA output even for FASTQ input.
    pub force_fasta: bool,
}

impl OutputLayout {
    fn route_for(&self, verdict: Verdict, name1: Option<&str>, name2: Option<&str>) -> Route {
        match verdict {
            Verdict::Keep => match &self.demux {
                Some(demux) => demux.route(name1, name2),
                None => self.main,
            },
            Verdict::TooShort => self.too_short,
            Verdict::TooLong => self.too_long,
            Verdict::DiscardUntrimmed => self.untrimmed,
            _ => Route::Drop,
        }
    }

    /// Opens every slot. Gzip sinks run on separate compression threads
    /// while the budget of `min(cores, 4)` lasts.
    ///
    /// ## Errors
    ///
    /// Any file creation error is propagated.
    fn open_writers(&self, compression_level: u32, cores: usize) -> std::io::Result<Vec<OutputWriter>> {
        let mut gzip_threads = cores.min(4);
        self.slots
            .iter()
            .map(|path| create_output(path, compression_level, &mut gzip_threads))
            .collect()
    }
}

/// Input paths; `-` is standard input.
#[derive(Debug, Clone)]
pub struct InputConfig {
    pub path1: String,
    pub path2: Option<String>,
    pub interleaved: bool,
}

/// Runtime knobs for the runner.
#[derive(Debug, Clone, Copy)]
pub struct RunConfig {
    pub cores: usize,
    pub buffer_size: usize,
    pub compression_level: u32,
}

/// Runs the pipeline over the inputs, serially or in parallel depending on
/// the requested core count.
///
/// ## Errors
///
/// IO errors, malformed input, and length-mismatched pairs are propagated;
/// outputs written so far are left flushed per sink up to the last
/// committed chunk.
pub fn run(
    pipeline: &Pipeline, inputs: &InputConfig, layout: &OutputLayout, config: &RunConfig,
) -> std::io::Result<Statistics> {
    if config.cores > 1 {
        run_parallel(pipeline, inputs, layout, config)
    } else {
        run_serial(pipeline, inputs, layout, config)
    }
}

fn mismatch_error() -> Error {
    Error::new(
        ErrorKind::InvalidData,
        "the two input files have different numbers of reads",
    )
}

/// Single-threaded execution: read, process, write, fold statistics.
fn run_serial(
    pipeline: &Pipeline, inputs: &InputConfig, layout: &OutputLayout, config: &RunConfig,
) -> std::io::Result<Statistics> {
    let mut reader1 = FastXReader::from_readable(open_input(&inputs.path1)?)?;
    let mut stats = Statistics::new(pipeline.adapters1.len(), pipeline.adapters2.len());
    let mut scratch = AlignScratch::default();
    let mut writers = layout.open_writers(config.compression_level, 1)?;
    let as_fasta = layout.force_fasta || reader1.format() == Format::Fasta;
    let (mut info1, mut info2) = (ReadInfo::default(), ReadInfo::default());

    if let Some(path2) = &inputs.path2 {
        let mut reader2 = FastXReader::from_readable(open_input(path2)?)?;
        loop {
            match (reader1.next_record(), reader2.next_record()) {
                (None, None) => break,
                (Some(r1), Some(r2)) => {
                    let (mut r1, mut r2) = (r1?, r2?);
                    handle_pair(
                        &mut r1, &mut r2, pipeline, layout, as_fasta, &mut stats, &mut scratch, &mut info1,
                        &mut info2, &mut writers,
                    )?;
                }
                _ => return Err(mismatch_error()),
            }
        }
    } else if inputs.interleaved {
        while let Some(r1) = reader1.next_record() {
            let mut r1 = r1?;
            let Some(r2) = reader1.next_record() else {
                return Err(Error::new(
                    ErrorKind::InvalidData,
                    "interleaved input has an odd number of reads",
                ));
            };
            let mut r2 = r2?;
            handle_pair(
                &mut r1, &mut r2, pipeline, layout, as_fasta, &mut stats, &mut scratch, &mut info1, &mut info2,
                &mut writers,
            )?;
        }
    } else {
        while let Some(record) = reader1.next_record() {
            let mut record = record?;
            handle_single(
                &mut record, pipeline, layout, as_fasta, &mut stats, &mut scratch, &mut info1, &mut writers,
            )?;
        }
    }

    for writer in writers {
        writer.finish()?;
    }
    Ok(stats)
}

/// One chunk of work travelling from the reader to a worker.
struct ChunkMsg {
    id:      u64,
    format1: Format,
    data1:   Vec<u8>,
    format2: Option<Format>,
    data2:   Option<Vec<u8>>,
}

/// Reader / worker-pool / ordered-writer execution.
fn run_parallel(
    pipeline: &Pipeline, inputs: &InputConfig, layout: &OutputLayout, config: &RunConfig,
) -> std::io::Result<Statistics> {
    let n_workers = config.cores;
    let writers = layout.open_writers(config.compression_level, config.cores)?;
    let (chunk_tx, chunk_rx) = bounded::<ChunkMsg>(n_workers * 2);
    let (out_tx, out_rx) = bounded::<(u64, std::io::Result<Vec<Vec<u8>>>)>(n_workers * 2);

    let mut input1 = ChunkReader::new(open_input(&inputs.path1)?, config.buffer_size);
    let mut input2 = match &inputs.path2 {
        Some(path) => Some(ChunkReader::new(open_input(path)?, config.buffer_size)),
        None => None,
    };
    let group = if inputs.interleaved { 2 } else { 1 };

    std::thread::scope(|scope| -> std::io::Result<Statistics> {
        let reader = scope.spawn(move || -> std::io::Result<()> {
            let mut id = 0u64;
            while let Some(chunk1) = input1.next_chunk(group)? {
                let format1 = input1.detect()?.expect("format known after a chunk");
                let (format2, data2) = match &mut input2 {
                    Some(input2) => {
                        let chunk2 = input2.read_exact_records(chunk1.records)?;
                        (input2.detect()?, Some(chunk2.data))
                    }
                    None => (None, None),
                };
                let msg = ChunkMsg {
                    id,
                    format1,
                    data1: chunk1.data,
                    format2,
                    data2,
                };
                if chunk_tx.send(msg).is_err() {
                    // Downstream shut down (e.g. on error); stop producing.
                    return Ok(());
                }
                id += 1;
            }
            if let Some(input2) = &mut input2
                && !input2.at_end()?
            {
                return Err(mismatch_error());
            }
            drop(chunk_tx);
            Ok(())
        });

        let mut workers = Vec::with_capacity(n_workers);
        for _ in 0..n_workers {
            let chunk_rx = chunk_rx.clone();
            let out_tx = out_tx.clone();
            workers.push(scope.spawn(move || -> Statistics {
                let mut stats = Statistics::new(pipeline.adapters1.len(), pipeline.adapters2.len());
                let mut scratch = AlignScratch::default();
                let (mut info1, mut info2) = (ReadInfo::default(), ReadInfo::default());
                for msg in chunk_rx.iter() {
                    let id = msg.id;
                    let result = process_chunk(
                        msg, pipeline, layout, inputs, &mut stats, &mut scratch, &mut info1, &mut info2,
                    );
                    if out_tx.send((id, result)).is_err() {
                        break;
                    }
                }
                stats
            }));
        }
        // The clones owned by the workers keep the channels alive.
        drop(chunk_rx);
        drop(out_tx);

        let writer = scope.spawn(move || -> std::io::Result<()> {
            let mut writers = writers;
            let mut pending: HashMap<u64, Vec<Vec<u8>>> = HashMap::new();
            let mut next = 0u64;
            for (id, result) in out_rx.iter() {
                pending.insert(id, result?);
                while let Some(buffers) = pending.remove(&next) {
                    for (slot, buffer) in buffers.into_iter().enumerate() {
                        if !buffer.is_empty() {
                            writers[slot].write_all(&buffer)?;
                        }
                    }
                    next += 1;
                }
            }
            for writer in writers {
                writer.finish()?;
            }
            Ok(())
        });

        let reader_result = reader.join().expect("reader thread panicked");
        let mut stats = Statistics::new(pipeline.adapters1.len(), pipeline.adapters2.len());
        for worker in workers {
            stats.merge(worker.join().expect("worker thread panicked"));
        }
        let writer_result = writer.join().expect("writer thread panicked");

        writer_result?;
        reader_result?;
        Ok(stats)
    })
}

/// Parses and processes one chunk, returning the serialized output buffer
/// for every slot.
#[allow(clippy::too_many_arguments)]
fn process_chunk(
    msg: ChunkMsg, pipeline: &Pipeline, layout: &OutputLayout, inputs: &InputConfig, stats: &mut Statistics,
    scratch: &mut AlignScratch, info1: &mut ReadInfo, info2: &mut ReadInfo,
) -> std::io::Result<Vec<Vec<u8>>> {
    let as_fasta = layout.force_fasta || msg.format1 == Format::Fasta;
    let mut buffers: Vec<Vec<u8>> = vec![Vec::new(); layout.slots.len()];
    let records1 = parse_chunk(&msg.data1, msg.format1)?;

    if let Some(data2) = &msg.data2 {
        let records2 = parse_chunk(data2, msg.format2.unwrap_or(msg.format1))?;
        if records1.len() != records2.len() {
            return Err(mismatch_error());
        }
        for (mut r1, mut r2) in records1.into_iter().zip(records2) {
            handle_pair(
                &mut r1, &mut r2, pipeline, layout, as_fasta, stats, scratch, info1, info2, &mut buffers,
            )?;
        }
    } else if inputs.interleaved {
        let mut iter = records1.into_iter();
        while let Some(mut r1) = iter.next() {
            let mut r2 = iter.next().expect("chunking guarantees full pairs");
            handle_pair(
                &mut r1, &mut r2, pipeline, layout, as_fasta, stats, scratch, info1, info2, &mut buffers,
            )?;
        }
    } else {
        for mut record in records1 {
            handle_single(&mut record, pipeline, layout, as_fasta, stats, scratch, info1, &mut buffers)?;
        }
    }
    Ok(buffers)
}

#[allow(clippy::too_many_arguments)]
fn handle_single<W: Write>(
    read: &mut SeqRecord, pipeline: &Pipeline, layout: &OutputLayout, as_fasta: bool, stats: &mut Statistics,
    scratch: &mut AlignScratch, info: &mut ReadInfo, out: &mut [W],
) -> std::io::Result<()> {
    let verdict = pipeline.process_single(read, info, stats, scratch);
    let route = layout.route_for(verdict, info.adapter_name(&pipeline.adapters1), None);
    emit(route, read, None, as_fasta, out)?;
    write_side_lines(read, info, &pipeline.adapters1, layout, out)
}

#[allow(clippy::too_many_arguments)]
fn handle_pair<W: Write>(
    r1: &mut SeqRecord, r2: &mut SeqRecord, pipeline: &Pipeline, layout: &OutputLayout, as_fasta: bool,
    stats: &mut Statistics, scratch: &mut AlignScratch, info1: &mut ReadInfo, info2: &mut ReadInfo,
    out: &mut [W],
) -> std::io::Result<()> {
    let verdict = pipeline.process_pair(r1, r2, info1, info2, stats, scratch);
    let route = layout.route_for(
        verdict,
        info1.adapter_name(&pipeline.adapters1),
        info2.adapter_name(&pipeline.adapters2),
    );
    emit(route, r1, Some(r2), as_fasta, out)?;
    write_side_lines(r1, info1, &pipeline.adapters1, layout, out)
}

fn emit<W: Write>(
    route: Route, r1: &SeqRecord, r2: Option<&SeqRecord>, as_fasta: bool, out: &mut [W],
) -> std::io::Result<()> {
    match route {
        Route::Drop => Ok(()),
        Route::Single(slot) => r1.write_to(&mut out[slot], as_fasta),
        Route::Interleaved(slot) => {
            r1.write_to(&mut out[slot], as_fasta)?;
            if let Some(r2) = r2 {
                r2.write_to(&mut out[slot], as_fasta)?;
            }
            Ok(())
        }
        Route::Pair(slot1, slot2) => {
            r1.write_to(&mut out[slot1], as_fasta)?;
            if let Some(r2) = r2 {
                r2.write_to(&mut out[slot2], as_fasta)?;
            }
            Ok(())
        }
    }
}

/// Per-match side channel records (rest, info, wildcard files). These are
/// fed by R1 matches; their per-read ordering follows the input order.
fn write_side_lines<W: Write>(
    read: &SeqRecord, info: &ReadInfo, adapters: &[Adapter], layout: &OutputLayout, out: &mut [W],
) -> std::io::Result<()> {
    if let Some(slot) = layout.rest {
        for event in &info.matches {
            if event.m.side == MatchSide::Back
                && let Some(seq) = &event.seq
            {
                out[slot].write_all(&seq[event.m.hit.rstart..])?;
                out[slot].write_all(b" ")?;
                out[slot].write_all(&read.head)?;
                out[slot].write_all(b"\n")?;
            }
        }
    }

    if let Some(slot) = layout.wildcard {
        for event in &info.matches {
            let adapter = &adapters[event.adapter_ix];
            if adapter.track_wildcards
                && let Some(seq) = &event.seq
            {
                let bases = adapter.wildcard_bases(seq, &event.m);
                out[slot].write_all(&bases)?;
                out[slot].write_all(b" ")?;
                out[slot].write_all(&read.head)?;
                out[slot].write_all(b"\n")?;
            }
        }
    }

    if let Some(slot) = layout.info {
        let writer = &mut out[slot];
        if info.matches.is_empty() {
            writer.write_all(&read.head)?;
            writer.write_all(b"\t-1\t\t\t\t\t\t\t\t\t\n")?;
        }
        for event in &info.matches {
            let (Some(seq), hit) = (&event.seq, &event.m.hit) else {
                continue;
            };
            let empty = Vec::new();
            let qual = event.qual.as_ref().unwrap_or(&empty);
            writer.write_all(&read.head)?;
            write!(writer, "\t{}\t{}\t{}\t", hit.errors, hit.rstart, hit.rend)?;
            writer.write_all(&seq[..hit.rstart])?;
            writer.write_all(b"\t")?;
            writer.write_all(&seq[hit.rstart..hit.rend])?;
            writer.write_all(b"\t")?;
            writer.write_all(&seq[hit.rend..])?;
            writer.write_all(b"\t")?;
            writer.write_all(adapters[event.adapter_ix].name.as_bytes())?;
            writer.write_all(b"\t")?;
            if qual.is_empty() {
                writer.write_all(b"\t\t")?;
            } else {
                writer.write_all(&qual[hit.rstart..hit.rend])?;
                writer.write_all(b"\t")?;
                writer.write_all(&qual[..hit.rstart])?;
                writer.write_all(b"\t")?;
                writer.write_all(&qual[hit.rend..])?;
            }
            writer.write_all(b"\n")?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        adapters::{parse_adapter_spec, AdapterDefaults, AdapterKind},
        modifiers::{Action, AdapterCutter, PairedModifier, SingleModifier},
        pipeline::{Filters, PairFilterMode},
    };
    use std::{fs, path::PathBuf, sync::Arc};

    fn temp_path(name: &str) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("readclip-test-{}-{name}", std::process::id()));
        path
    }

    fn back_pipeline(spec: &str) -> Pipeline {
        let mut counter = 0;
        let defaults = AdapterDefaults::default();
        let list = Arc::new(parse_adapter_spec(spec, AdapterKind::Back, &defaults, &mut counter).unwrap());
        let cutter = AdapterCutter::new(list.clone(), 1, Action::Trim, true);
        Pipeline {
            steps: vec![PairedModifier::Each(Some(SingleModifier::AdapterCut(cutter)), None)],
            filters: Filters::default(),
            pair_filter_mode: PairFilterMode::Any,
            override_untrimmed_pair_filter: false,
            adapters1: list,
            adapters2: Arc::new(Vec::new()),
            quality_base: 33,
            collect_snapshots: false,
            paired: false,
        }
    }

    fn single_layout(name: &str) -> (OutputLayout, PathBuf) {
        let out = temp_path(name);
        let layout = OutputLayout {
            slots: vec![out.to_string_lossy().into_owned()],
            main: Route::Single(0),
            demux: None,
            too_short: Route::Drop,
            too_long: Route::Drop,
            untrimmed: Route::Drop,
            info: None,
            rest: None,
            wildcard: None,
            force_fasta: false,
        };
        (layout, out)
    }

    fn write_input(name: &str, records: usize) -> PathBuf {
        let path = temp_path(name);
        let mut data = String::new();
        for i in 0..records {
            data.push_str(&format!("@r{i}\nACGTACGTAAAATTTT\n+\nIIIIIIIIIIIIIIII\n"));
        }
        fs::write(&path, data).unwrap();
        path
    }

    #[test]
    fn parallel_output_matches_serial() {
        let input = write_input("order-in.fastq", 120);
        let pipeline = back_pipeline("AAAATTTT");
        let inputs = InputConfig {
            path1: input.to_string_lossy().into_owned(),
            path2: None,
            interleaved: false,
        };

        let (layout_a, out_a) = single_layout("order-serial.fastq");
        let serial_stats = run(
            &pipeline,
            &inputs,
            &layout_a,
            &RunConfig {
                cores: 1,
                buffer_size: 1 << 16,
                compression_level: 5,
            },
        )
        .unwrap();
        let serial = fs::read(&out_a).unwrap();

        let out_b = temp_path("order-par.fastq");
        let layout_b = OutputLayout {
            slots: vec![out_b.to_string_lossy().into_owned()],
            ..single_layout("order-par-template.fastq").0
        };
        // A tiny buffer forces many chunks, exercising the reordering.
        let parallel_stats = run(
            &pipeline,
            &inputs,
            &layout_b,
            &RunConfig {
                cores: 4,
                buffer_size: 256,
                compression_level: 5,
            },
        )
        .unwrap();
        let parallel = fs::read(&out_b).unwrap();

        assert_eq!(serial, parallel);
        assert_eq!(serial_stats.records, 120);
        assert_eq!(parallel_stats.records, 120);
        assert_eq!(serial_stats.written, parallel_stats.written);
        assert_eq!(
            serial_stats.adapters[0][0].back.lengths,
            parallel_stats.adapters[0][0].back.lengths
        );

        for path in [input, out_a, out_b] {
            let _ = fs::remove_file(path);
        }
    }

    #[test]
    fn serial_trims_and_counts() {
        let input = write_input("serial-in.fastq", 3);
        let pipeline = back_pipeline("AAAATTTT");
        let (layout, out) = single_layout("serial-main.fastq");
        let stats = run(
            &pipeline,
            &InputConfig {
                path1: input.to_string_lossy().into_owned(),
                path2: None,
                interleaved: false,
            },
            &layout,
            &RunConfig {
                cores: 1,
                buffer_size: 1 << 16,
                compression_level: 5,
            },
        )
        .unwrap();

        assert_eq!(stats.records, 3);
        assert_eq!(stats.reads_with_adapters[0], 3);
        let written = fs::read_to_string(&out).unwrap();
        assert_eq!(written.matches("ACGTACGT\n").count(), 3);
        assert!(!written.contains("AAAATTTT"));

        let _ = fs::remove_file(input);
        let _ = fs::remove_file(out);
    }

    #[test]
    fn combinatorial_demux_routes_by_both_names() {
        let demux = Demux {
            combinatorial: true,
            by_name: {
                let mut map = HashMap::new();
                map.insert(("A".to_string(), "Y".to_string()), Route::Pair(0, 1));
                map.insert(("A".to_string(), "unknown".to_string()), Route::Pair(2, 3));
                map
            },
            unknown: Route::Drop,
        };
        assert_eq!(demux.route(Some("A"), Some("Y")), Route::Pair(0, 1));
        assert_eq!(demux.route(Some("A"), None), Route::Pair(2, 3));
        assert_eq!(demux.route(None, Some("X")), Route::Drop);

        let plain = Demux {
            combinatorial: false,
            by_name: {
                let mut map = HashMap::new();
                map.insert(("A".to_string(), String::new()), Route::Single(0));
                map
            },
            unknown: Route::Single(9),
        };
        assert_eq!(plain.route(Some("A"), None), Route::Single(0));
        assert_eq!(plain.route(None, None), Route::Single(9));
    }
}
