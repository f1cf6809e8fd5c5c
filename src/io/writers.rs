use crate::{
    io::{compression_of, Compression as Compr},
    utils::whichever::define_whichever,
};
use bzip2::write::BzEncoder;
use flate2::{write::GzEncoder, Compression};
use std::{
    fs::File,
    io::{stdout, BufWriter, PipeWriter, Stdout, Write},
    thread::{self, JoinHandle},
};
use xz2::write::XzEncoder;

/// A gzip writer that compresses on a separate thread, fed through an
/// anonymous pipe. The number of these per invocation is budgeted by the
/// runner.
pub(crate) struct GzipWriterPiped {
    writer: Option<PipeWriter>,
    thread: Option<JoinHandle<std::io::Result<()>>>,
}

impl GzipWriterPiped {
    /// Spawns the compression thread writing to `file`.
    ///
    /// ## Errors
    ///
    /// Pipe creation must succeed.
    fn spawn(file: File, level: u32) -> std::io::Result<Self> {
        let (mut reader, writer) = std::io::pipe()?;

        let thread = thread::spawn(move || -> std::io::Result<_> {
            let mut encoder = GzEncoder::new(BufWriter::new(file), Compression::new(level));
            std::io::copy(&mut reader, &mut encoder)?;
            encoder.finish()?.flush()
        });

        Ok(Self {
            writer: Some(writer),
            thread: Some(thread),
        })
    }

    /// Closes the pipe and waits for the compression thread.
    ///
    /// ## Errors
    ///
    /// Any error from the compression thread is propagated.
    fn finish(mut self) -> std::io::Result<()> {
        drop(self.writer.take());
        if let Some(thread) = self.thread.take() {
            thread.join().unwrap()?;
        }
        Ok(())
    }
}

impl Write for GzipWriterPiped {
    #[inline]
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.writer
            .as_mut()
            .expect("writer already finished")
            .write(buf)
    }

    #[inline]
    fn flush(&mut self) -> std::io::Result<()> {
        self.writer.as_mut().expect("writer already finished").flush()
    }
}

define_whichever! {
    /// An enum for the acceptable output sinks. A [`BufWriter`] backs all
    /// file variants.
    pub(crate) enum OutputWriter {
        File(BufWriter<File>),
        Stdout(BufWriter<Stdout>),
        Gzip(GzEncoder<BufWriter<File>>),
        GzipPiped(GzipWriterPiped),
        Xz(XzEncoder<BufWriter<File>>),
        Bzip2(BzEncoder<BufWriter<File>>),
    }

    impl Write for OutputWriter {}
}

impl OutputWriter {
    /// Flushes and finalizes the sink, writing compression trailers and
    /// joining any compression thread.
    ///
    /// ## Errors
    ///
    /// Any IO or compression error is propagated.
    pub(crate) fn finish(self) -> std::io::Result<()> {
        match self {
            OutputWriter::File(mut w) => w.flush(),
            OutputWriter::Stdout(mut w) => w.flush(),
            OutputWriter::Gzip(enc) => enc.finish()?.flush(),
            OutputWriter::GzipPiped(piped) => piped.finish(),
            OutputWriter::Xz(enc) => enc.finish()?.flush(),
            OutputWriter::Bzip2(enc) => enc.finish()?.flush(),
        }
    }
}

/// Creates an output sink for `path`. `-` denotes standard output; the
/// compression format follows the extension. Gzip outputs take a piped
/// compression thread while `gzip_threads` has budget left, and fall back
/// to inline compression afterwards.
///
/// ## Errors
///
/// File creation (and pipe creation for threaded gzip) must succeed.
pub(crate) fn create_output(path: &str, gzip_level: u32, gzip_threads: &mut usize) -> std::io::Result<OutputWriter> {
    if path == "-" {
        return Ok(OutputWriter::Stdout(BufWriter::new(stdout())));
    }
    let file = File::create(path)?;
    let writer = match compression_of(path) {
        Compr::None => OutputWriter::File(BufWriter::new(file)),
        Compr::Gzip => {
            if *gzip_threads > 0 {
                *gzip_threads -= 1;
                OutputWriter::GzipPiped(GzipWriterPiped::spawn(file, gzip_level)?)
            } else {
                OutputWriter::Gzip(GzEncoder::new(BufWriter::new(file), Compression::new(gzip_level)))
            }
        }
        Compr::Xz => OutputWriter::Xz(XzEncoder::new(BufWriter::new(file), 6)),
        Compr::Bzip2 => OutputWriter::Bzip2(BzEncoder::new(
            BufWriter::new(file),
            bzip2::Compression::default(),
        )),
    };
    Ok(writer)
}
