//! A reader over either FASTA or FASTQ data, determined automatically from
//! the first significant byte of the stream.

use crate::seq::SeqRecord;
use std::io::{Cursor, ErrorKind, Read};

/// The record format of an input stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Fastq,
    Fasta,
}

type Detected<R> = std::io::Chain<Cursor<Vec<u8>>, R>;

/// A reader over either FASTA or FASTQ records.
pub(crate) enum FastXReader<R: Read> {
    Fastq(seq_io::fastq::Reader<Detected<R>>),
    Fasta(seq_io::fasta::Reader<Detected<R>>),
}

impl<R: Read> FastXReader<R> {
    /// Creates a reader from any [`Read`], sniffing the format from the
    /// first non-whitespace byte.
    ///
    /// ## Errors
    ///
    /// Will return `Err` if an IO error occurs, or if the stream does not
    /// start with `@` or `>`. An empty stream is treated as empty FASTQ.
    pub fn from_readable(mut inner: R) -> std::io::Result<Self> {
        let mut byte = [0u8; 1];
        let start = loop {
            if inner.read(&mut byte)? == 0 {
                break None;
            }
            if !byte[0].is_ascii_whitespace() {
                break Some(byte[0]);
            }
        };

        let prefix = Cursor::new(start.map(|b| vec![b]).unwrap_or_default());
        let chained = prefix.chain(inner);
        match start {
            Some(b'>') => Ok(FastXReader::Fasta(seq_io::fasta::Reader::new(chained))),
            Some(b'@') | None => Ok(FastXReader::Fastq(seq_io::fastq::Reader::new(chained))),
            _ => Err(std::io::Error::new(
                ErrorKind::InvalidData,
                "unable to determine whether the input is FASTA or FASTQ",
            )),
        }
    }

    #[inline]
    pub fn format(&self) -> Format {
        match self {
            FastXReader::Fastq(_) => Format::Fastq,
            FastXReader::Fasta(_) => Format::Fasta,
        }
    }

    /// The next owned record, or `None` at end of input.
    pub fn next_record(&mut self) -> Option<std::io::Result<SeqRecord>> {
        match self {
            FastXReader::Fastq(reader) => {
                use seq_io::fastq::Record;
                reader.next().map(|result| {
                    result
                        .map(|rec| {
                            SeqRecord::new(rec.head().to_vec(), rec.seq().to_vec(), Some(rec.qual().to_vec()))
                        })
                        .map_err(std::io::Error::other)
                })
            }
            FastXReader::Fasta(reader) => {
                use seq_io::fasta::Record;
                reader.next().map(|result| {
                    result
                        .map(|rec| SeqRecord::new(rec.head().to_vec(), rec.full_seq().into_owned(), None))
                        .map_err(std::io::Error::other)
                })
            }
        }
    }
}

/// Parses every record of an in-memory chunk, which must start at a record
/// boundary. Workers use this on reader-produced chunks.
///
/// ## Errors
///
/// Malformed records are reported as `InvalidData`.
pub(crate) fn parse_chunk(data: &[u8], format: Format) -> std::io::Result<Vec<SeqRecord>> {
    let mut records = Vec::new();
    match format {
        Format::Fastq => {
            use seq_io::fastq::Record;
            let mut reader = seq_io::fastq::Reader::new(data);
            while let Some(result) = reader.next() {
                let rec = result.map_err(std::io::Error::other)?;
                records.push(SeqRecord::new(
                    rec.head().to_vec(),
                    rec.seq().to_vec(),
                    Some(rec.qual().to_vec()),
                ));
            }
        }
        Format::Fasta => {
            use seq_io::fasta::Record;
            let mut reader = seq_io::fasta::Reader::new(data);
            while let Some(result) = reader.next() {
                let rec = result.map_err(std::io::Error::other)?;
                records.push(SeqRecord::new(rec.head().to_vec(), rec.full_seq().into_owned(), None));
            }
        }
    }
    Ok(records)
}
