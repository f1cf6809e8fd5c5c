//! Opening inputs and outputs with extension-based compression handling.

pub(crate) mod chunks;
pub(crate) mod fastx;
pub(crate) mod readers;
pub(crate) mod writers;

pub(crate) use readers::{open_input, open_source};
pub(crate) use writers::{create_output, OutputWriter};

use std::path::Path;

/// Compression family, decided by file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Compression {
    None,
    Gzip,
    Xz,
    Bzip2,
}

pub(crate) fn compression_of(path: impl AsRef<Path>) -> Compression {
    match path.as_ref().extension().and_then(|e| e.to_str()) {
        Some("gz") => Compression::Gzip,
        Some("xz") => Compression::Xz,
        Some("bz2") => Compression::Bzip2,
        _ => Compression::None,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn extension_detection() {
        assert_eq!(compression_of("reads.fastq.gz"), Compression::Gzip);
        assert_eq!(compression_of("reads.fastq.xz"), Compression::Xz);
        assert_eq!(compression_of("reads.fastq.bz2"), Compression::Bzip2);
        assert_eq!(compression_of("reads.fastq"), Compression::None);
        assert_eq!(compression_of("-"), Compression::None);
    }
}
