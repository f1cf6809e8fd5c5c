//! Record-boundary-aligned chunked reading for the parallel runner.
//!
//! The reader thread cuts the raw input into `buffer_size`-sized byte
//! chunks whose boundaries always coincide with record boundaries, so each
//! worker can parse its chunk independently. Boundaries are found by newline
//! counting (FASTQ: four lines per record) or `>`-line scanning (FASTA),
//! never by sniffing record content.

use crate::io::fastx::Format;
use memchr::memchr_iter;
use std::io::{Error, ErrorKind, Read};

const FILL_STEP: usize = 64 * 1024;

/// A contiguous byte block holding `records` complete records.
#[derive(Debug)]
pub(crate) struct Chunk {
    pub data:    Vec<u8>,
    pub records: usize,
}

pub(crate) struct ChunkReader<R> {
    inner:       R,
    carry:       Vec<u8>,
    buffer_size: usize,
    eof:         bool,
    format:      Option<Format>,
}

impl<R: Read> ChunkReader<R> {
    pub fn new(inner: R, buffer_size: usize) -> Self {
        ChunkReader {
            inner,
            carry: Vec::new(),
            buffer_size: buffer_size.max(1024),
            eof: false,
            format: None,
        }
    }

    fn fill(&mut self, target: usize) -> std::io::Result<()> {
        while !self.eof && self.carry.len() < target {
            let old = self.carry.len();
            self.carry.resize(old + FILL_STEP, 0);
            let n = self.inner.read(&mut self.carry[old..])?;
            self.carry.truncate(old + n);
            if n == 0 {
                self.eof = true;
            }
        }
        Ok(())
    }

    /// The stream format, sniffed from the first significant byte. `None`
    /// for an empty stream.
    pub fn detect(&mut self) -> std::io::Result<Option<Format>> {
        if self.format.is_some() {
            return Ok(self.format);
        }
        loop {
            let ws = self
                .carry
                .iter()
                .take_while(|b| b.is_ascii_whitespace())
                .count();
            if ws > 0 {
                self.carry.drain(..ws);
            }
            if let Some(&byte) = self.carry.first() {
                self.format = Some(match byte {
                    b'@' => Format::Fastq,
                    b'>' => Format::Fasta,
                    _ => {
                        return Err(Error::new(
                            ErrorKind::InvalidData,
                            "unable to determine whether the input is FASTA or FASTQ",
                        ));
                    }
                });
                return Ok(self.format);
            }
            if self.eof {
                return Ok(None);
            }
            let target = self.carry.len() + FILL_STEP;
            self.fill(target)?;
        }
    }

    /// The next chunk holding a (nonzero) multiple of `group` records, or
    /// `None` when the input is exhausted. The internal target grows past
    /// `buffer_size` whenever a record group does not fit.
    ///
    /// ## Errors
    ///
    /// A truncated final record, or a final group that is not a multiple of
    /// `group` (odd interleaved input), is an error.
    pub fn next_chunk(&mut self, group: usize) -> std::io::Result<Option<Chunk>> {
        let mut target = self.buffer_size;
        loop {
            self.fill(target)?;
            let Some(format) = self.detect()? else {
                return Ok(None);
            };
            if self.carry.is_empty() {
                return Ok(None);
            }

            let total = count_complete_records(&self.carry, format, self.eof);
            let usable = total / group * group;
            if usable == 0 {
                if self.eof {
                    let message = if total == 0 {
                        "truncated record at end of input"
                    } else {
                        "interleaved input ends with an incomplete pair"
                    };
                    return Err(Error::new(ErrorKind::InvalidData, message));
                }
                target += self.buffer_size;
                continue;
            }

            let off = if self.eof && total == usable {
                match offset_after(&self.carry, format, usable) {
                    Some(off) if self.carry[off..].iter().all(|b| b.is_ascii_whitespace()) => self.carry.len(),
                    Some(_) => {
                        return Err(Error::new(
                            ErrorKind::InvalidData,
                            "truncated record at end of input",
                        ));
                    }
                    // The final record runs to EOF without a trailing newline.
                    None => self.carry.len(),
                }
            } else {
                offset_after(&self.carry, format, usable).expect("complete records must have an end offset")
            };

            let rest = self.carry.split_off(off);
            let data = std::mem::replace(&mut self.carry, rest);
            return Ok(Some(Chunk {
                data,
                records: usable,
            }));
        }
    }

    /// Reads exactly `n` records, growing the buffer as needed. Used for
    /// the second input of a pair, which must stay synchronized with the
    /// chunk boundaries of the first.
    ///
    /// ## Errors
    ///
    /// Running out of input before `n` records is an error.
    pub fn read_exact_records(&mut self, n: usize) -> std::io::Result<Chunk> {
        if n == 0 {
            return Ok(Chunk {
                data:    Vec::new(),
                records: 0,
            });
        }
        loop {
            let Some(format) = self.detect()? else {
                return Err(Error::new(
                    ErrorKind::InvalidData,
                    "the second input has fewer reads than the first",
                ));
            };
            let total = count_complete_records(&self.carry, format, self.eof);
            if total >= n {
                let off = match offset_after(&self.carry, format, n) {
                    Some(off) => off,
                    None => self.carry.len(),
                };
                let rest = self.carry.split_off(off);
                let data = std::mem::replace(&mut self.carry, rest);
                return Ok(Chunk { data, records: n });
            }
            if self.eof {
                return Err(Error::new(
                    ErrorKind::InvalidData,
                    "the second input has fewer reads than the first",
                ));
            }
            let target = self.carry.len() + self.buffer_size.max(FILL_STEP);
            self.fill(target)?;
        }
    }

    /// Whether the stream holds no further records.
    pub fn at_end(&mut self) -> std::io::Result<bool> {
        if self.detect()?.is_none() {
            return Ok(true);
        }
        loop {
            let ws = self
                .carry
                .iter()
                .take_while(|b| b.is_ascii_whitespace())
                .count();
            if ws > 0 {
                self.carry.drain(..ws);
            }
            if !self.carry.is_empty() {
                return Ok(false);
            }
            if self.eof {
                return Ok(true);
            }
            let target = self.carry.len() + FILL_STEP;
            self.fill(target)?;
        }
    }
}

fn count_complete_records(data: &[u8], format: Format, eof: bool) -> usize {
    match format {
        Format::Fastq => {
            let newlines = memchr_iter(b'\n', data).count();
            let mut count = newlines / 4;
            // The final quality line may run to EOF without a newline.
            if eof && newlines % 4 == 3 && !data.ends_with(b"\n") {
                count += 1;
            }
            count
        }
        Format::Fasta => {
            let starts = usize::from(data.first() == Some(&b'>'))
                + memchr_iter(b'\n', data)
                    .filter(|&p| data.get(p + 1) == Some(&b'>'))
                    .count();
            if eof {
                starts
            } else {
                starts.saturating_sub(1)
            }
        }
    }
}

/// Byte offset just past the `n`-th record, or `None` when that record runs
/// to the end of `data` without a trailing boundary.
fn offset_after(data: &[u8], format: Format, n: usize) -> Option<usize> {
    if n == 0 {
        return Some(0);
    }
    match format {
        Format::Fastq => memchr_iter(b'\n', data).nth(4 * n - 1).map(|p| p + 1),
        Format::Fasta => {
            let mut seen = 0usize;
            for p in memchr_iter(b'\n', data) {
                if data.get(p + 1) == Some(&b'>') {
                    seen += 1;
                    if seen == n {
                        return Some(p + 1);
                    }
                }
            }
            None
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn fastq(n: usize) -> Vec<u8> {
        (0..n)
            .flat_map(|i| format!("@r{i}\nACGTACGT\n+\nIIIIIIII\n").into_bytes())
            .collect()
    }

    #[test]
    fn chunks_align_to_fastq_records() {
        let data = fastq(25);
        let mut reader = ChunkReader::new(&data[..], 100);
        let mut out = Vec::new();
        let mut total_records = 0;
        while let Some(chunk) = reader.next_chunk(1).unwrap() {
            assert!(chunk.records > 0);
            assert_eq!(chunk.data[0], b'@', "chunk must start at a record");
            total_records += chunk.records;
            out.extend_from_slice(&chunk.data);
        }
        assert_eq!(total_records, 25);
        assert_eq!(out, data);
    }

    #[test]
    fn missing_final_newline_is_tolerated() {
        let mut data = fastq(2);
        data.pop();
        let mut reader = ChunkReader::new(&data[..], 16);
        let mut records = 0;
        while let Some(chunk) = reader.next_chunk(1).unwrap() {
            records += chunk.records;
        }
        assert_eq!(records, 2);
    }

    #[test]
    fn truncated_record_is_an_error() {
        let data = b"@r0\nACGT\n+\nIIII\n@r1\nACGT\n";
        let mut reader = ChunkReader::new(&data[..], 8);
        let mut last = Ok(None);
        loop {
            match reader.next_chunk(1) {
                Ok(None) => break,
                Ok(Some(_)) => continue,
                err => {
                    last = err;
                    break;
                }
            }
        }
        assert!(last.is_err());
    }

    #[test]
    fn fasta_chunks_split_on_headers() {
        let data = b">a\nACGT\nGGG\n>b\nTT\n>c\nAAAA\n";
        let mut reader = ChunkReader::new(&data[..], 10);
        let mut out = Vec::new();
        let mut records = 0;
        while let Some(chunk) = reader.next_chunk(1).unwrap() {
            assert_eq!(chunk.data[0], b'>');
            records += chunk.records;
            out.extend_from_slice(&chunk.data);
        }
        assert_eq!(records, 3);
        assert_eq!(out, data);
    }

    #[test]
    fn interleaved_grouping_is_even() {
        let data = fastq(6);
        let mut reader = ChunkReader::new(&data[..], 80);
        while let Some(chunk) = reader.next_chunk(2).unwrap() {
            assert_eq!(chunk.records % 2, 0);
        }

        let odd = fastq(3);
        let mut reader = ChunkReader::new(&odd[..], 1 << 20);
        let result = reader.next_chunk(2);
        assert!(result.is_err() || result.unwrap().map(|c| c.records) != Some(3));
    }

    #[test]
    fn paired_readers_stay_synchronized() {
        let r1 = fastq(10);
        let r2 = fastq(10);
        let mut reader1 = ChunkReader::new(&r1[..], 120);
        let mut reader2 = ChunkReader::new(&r2[..], 120);
        let mut seen = 0;
        while let Some(chunk1) = reader1.next_chunk(1).unwrap() {
            let chunk2 = reader2.read_exact_records(chunk1.records).unwrap();
            assert_eq!(chunk1.records, chunk2.records);
            seen += chunk1.records;
        }
        assert!(reader2.at_end().unwrap());
        assert_eq!(seen, 10);
    }

    #[test]
    fn second_input_shorter_is_an_error() {
        let r2 = fastq(1);
        let mut reader2 = ChunkReader::new(&r2[..], 64);
        assert!(reader2.read_exact_records(3).is_err());
    }
}
