//! File logger that rolls by size.
//!
//! `tracing-appender`'s rolling appenders rotate on a time schedule; the relay
//! instead starts a new file whenever the current one reaches [`MAX_FILE_SIZE`],
//! so a long-lived but quiet process does not scatter its history over hundreds
//! of near-empty files.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::{fs, io};

use time::OffsetDateTime;
use tracing::Subscriber;
use tracing_appender::non_blocking::{NonBlockingBuilder, WorkerGuard};
use tracing_subscriber::Layer;

const TIME_FORMAT: &str = "[year]-[month]-[day]-[hour]-[minute]-[second]";

/// Size at which the current log file is closed and a new one is started.
pub const MAX_FILE_SIZE: u64 = 1024 * 1024;

/// How many lines we will at most buffer in the channel with the background thread that writes to disk.
///
/// The relay is silent in steady state; this buffer only needs to handle bursts.
const MAX_BUFFERED_LINES: usize = 1024;

/// Create a new file logger layer.
pub fn layer<T>(
    log_dir: &Path,
    file_base_name: &'static str,
) -> (Box<dyn Layer<T> + Send + Sync + 'static>, Handle)
where
    T: Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    let appender = Appender {
        directory: log_dir.to_path_buf(),
        file_base_name,
        sequence: 0,
        current: None,
    };

    let (non_blocking, guard) = NonBlockingBuilder::default()
        .buffered_lines_limit(MAX_BUFFERED_LINES)
        .finish(appender);

    let layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(non_blocking)
        .boxed();

    let handle = Handle {
        _guard: Arc::new(guard),
    };

    // Return the guard so that the caller maintains a handle to it. Otherwise,
    // we have to wait for tracing_appender to flush the logs before exiting.
    // See https://docs.rs/tracing-appender/latest/tracing_appender/non_blocking/struct.WorkerGuard.html
    (layer, handle)
}

/// A handle to our file-logger.
///
/// This handle houses the [`WorkerGuard`] of the underlying non-blocking appender.
/// Thus, you MUST NOT drop this handle for as long as you want messages to arrive at the log file.
#[must_use]
#[derive(Clone, Debug)]
pub struct Handle {
    _guard: Arc<WorkerGuard>,
}

#[derive(Debug)]
struct Appender {
    directory: PathBuf,
    file_base_name: &'static str,
    sequence: u64,
    // Leaving this so that I/O errors come up through `write` instead of
    // panicking in `layer`.
    current: Option<(fs::File, u64)>,
}

impl Appender {
    fn with_current_file<R>(
        &mut self,
        len: u64,
        cb: impl Fn(&mut fs::File) -> io::Result<R>,
    ) -> io::Result<R> {
        match self.current.as_mut() {
            Some((file, written)) if *written + len <= MAX_FILE_SIZE => {
                *written += len;

                cb(file)
            }
            Some(_) | None => {
                let mut file = self.create_new_writer()?;

                let ret = cb(&mut file);

                self.current = Some((file, len));

                ret
            }
        }
    }

    fn create_new_writer(&mut self) -> io::Result<fs::File> {
        let format = time::format_description::parse(TIME_FORMAT).map_err(io::Error::other)?;
        let date = OffsetDateTime::now_utc()
            .format(&format)
            .map_err(|_| io::Error::other("Failed to format timestamp"))?;

        // The sequence number keeps names unique when we roll several times
        // within the same second.
        self.sequence += 1;
        let filename = format!("{}.{date}.{}.log", self.file_base_name, self.sequence);

        fs::create_dir_all(&self.directory)?;

        fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(self.directory.join(filename))
    }
}

impl io::Write for Appender {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.with_current_file(buf.len() as u64, |f| f.write(buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        self.with_current_file(0, |f| f.flush())
    }
}
