use crate::{
    io::{compression_of, Compression},
    utils::whichever::define_whichever,
};
use bzip2::read::MultiBzDecoder;
use flate2::read::MultiGzDecoder;
use std::{
    fs::File,
    io::{stdin, PipeReader, Read, Stdin},
    path::Path,
    thread::{self, JoinHandle},
};
use xz2::read::XzDecoder;

/// A reader that decodes compressed data eagerly on a separate thread,
/// handing the decoded bytes over through an anonymous pipe.
///
/// This is designed for scenarios where the file is read in its entirety.
/// Decoder failures surface when EOF is reached.
pub(crate) struct DecodeThreadReader {
    reader: PipeReader,
    thread: Option<JoinHandle<std::io::Result<()>>>,
}

impl DecodeThreadReader {
    /// Spawns the decode thread for a type implementing [`Read`].
    ///
    /// ## Errors
    ///
    /// Any IO errors occurring when forming the pipe are propagated. Errors
    /// occurring during decoding appear when reading.
    fn from_decoder<R>(mut decoder: R) -> std::io::Result<Self>
    where
        R: Read + Send + 'static, {
        let (reader, mut writer) = std::io::pipe()?;

        let thread = thread::spawn(move || -> std::io::Result<_> {
            // A broken pipe here means the reading side was dropped early;
            // in that case the thread is never joined either.
            std::io::copy(&mut decoder, &mut writer)?;
            Ok(())
        });

        Ok(Self {
            reader,
            thread: Some(thread),
        })
    }
}

impl Read for DecodeThreadReader {
    #[inline]
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let bytes_read = self.reader.read(buf)?;

        // Propagate decode errors at EOF
        if bytes_read == 0
            && !buf.is_empty()
            && let Some(thread) = self.thread.take()
        {
            thread.join().unwrap()?;
        }

        Ok(bytes_read)
    }
}

define_whichever! {
    /// An enum for the acceptable input sources: plain files, standard
    /// input, and compressed files decoded on a separate thread.
    pub(crate) enum InputReader {
        File(File),
        Stdin(Stdin),
        Decoded(DecodeThreadReader),
    }

    impl Read for InputReader {}
}

/// Opens a main input for processing. `-` denotes standard input; `.gz`,
/// `.xz` and `.bz2` files are decoded eagerly on a separate thread.
///
/// ## Errors
///
/// The file must exist, and pipe creation must succeed for compressed input.
pub(crate) fn open_input(path: &str) -> std::io::Result<InputReader> {
    if path == "-" {
        return Ok(InputReader::Stdin(stdin()));
    }
    let file = File::open(path)?;
    let reader = match compression_of(path) {
        Compression::None => InputReader::File(file),
        Compression::Gzip => InputReader::Decoded(DecodeThreadReader::from_decoder(MultiGzDecoder::new(file))?),
        Compression::Xz => InputReader::Decoded(DecodeThreadReader::from_decoder(XzDecoder::new(file))?),
        Compression::Bzip2 => InputReader::Decoded(DecodeThreadReader::from_decoder(MultiBzDecoder::new(file))?),
    };
    Ok(reader)
}

/// Opens an auxiliary input (e.g. a `file:` adapter list) with lazy, inline
/// decoding.
///
/// ## Errors
///
/// The file must exist.
pub(crate) fn open_source(path: &Path) -> std::io::Result<Box<dyn Read + Send>> {
    let file = File::open(path)?;
    let reader: Box<dyn Read + Send> = match compression_of(path) {
        Compression::None => Box::new(file),
        Compression::Gzip => Box::new(MultiGzDecoder::new(file)),
        Compression::Xz => Box::new(XzDecoder::new(file)),
        Compression::Bzip2 => Box::new(MultiBzDecoder::new(file)),
    };
    Ok(reader)
}
