use crossbeam_channel::{bounded, Receiver, Sender};
use flate2::read::MultiGzDecoder;
use std::fs::File;
use std::io::{BufRead, BufReader, Lines};
use std::path::{Path, PathBuf};
use std::thread;

use crate::error::{Error, Result};

/// Records handed from the reader thread to the consumer per message
pub const READ_BATCH_SIZE: usize = 4096;

/// Batches the reader thread may run ahead of the consumer
const PREFETCH_BATCHES: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FastqRecord {
    pub header: String,
    pub sequence: String,
    pub quality: String,
}

impl FastqRecord {
    pub fn new(header: String, sequence: String, quality: String) -> Self {
        FastqRecord {
            header,
            sequence,
            quality,
        }
    }

    /// Read identifier: the header without `@`, up to the first whitespace
    pub fn id(&self) -> &str {
        let head = self.header.strip_prefix('@').unwrap_or(&self.header);
        head.split_whitespace().next().unwrap_or("")
    }
}

fn next_line<R: BufRead>(lines: &mut Lines<R>, path: &Path) -> Result<Option<String>> {
    match lines.next() {
        Some(Ok(mut line)) => {
            // CRLF input
            if line.ends_with('\r') {
                line.pop();
            }
            Ok(Some(line))
        }
        Some(Err(e)) => Err(Error::io(path, e)),
        None => Ok(None),
    }
}

/// Reads one record; `Ok(None)` at a clean end of file.
///
/// Sequence and quality may each span several lines. Anything before the
/// first `@` line is ignored.
pub fn read_fastq_record<R: BufRead>(
    lines: &mut Lines<R>,
    path: &Path,
) -> Result<Option<FastqRecord>> {
    let header = loop {
        match next_line(lines, path)? {
            Some(line) if line.starts_with('@') => break line,
            Some(_) => {}
            None => return Ok(None),
        }
    };

    let mut sequence = String::new();
    while let Some(line) = next_line(lines, path)? {
        if line.starts_with('+') {
            return read_quality(lines, path, header, sequence).map(Some);
        }
        sequence.push_str(line.trim());
    }
    Err(Error::FastqFormat {
        path: path.to_path_buf(),
        reason: format!("unexpected end of file in sequence of {header}"),
    })
}

/// Quality lines after the `+` separator; consumes at least one line even
/// for an empty sequence so the next header is not swallowed.
fn read_quality<R: BufRead>(
    lines: &mut Lines<R>,
    path: &Path,
    header: String,
    sequence: String,
) -> Result<FastqRecord> {
    let mut quality = String::new();
    loop {
        let Some(line) = next_line(lines, path)? else {
            return Err(Error::FastqFormat {
                path: path.to_path_buf(),
                reason: format!("unexpected end of file in quality of {header}"),
            });
        };
        quality.push_str(line.trim());
        if quality.len() >= sequence.len() {
            break;
        }
    }
    // 多读的质量值截断到序列长度
    quality.truncate(sequence.len());
    Ok(FastqRecord::new(header, sequence, quality))
}

/// Up to `batch_size` records; shorter only at end of file.
pub fn read_fastq_batch<R: BufRead>(
    lines: &mut Lines<R>,
    batch_size: usize,
    path: &Path,
) -> Result<Vec<FastqRecord>> {
    let mut batch = Vec::with_capacity(batch_size);
    while batch.len() < batch_size {
        match read_fastq_record(lines, path)? {
            Some(record) => batch.push(record),
            None => break,
        }
    }
    Ok(batch)
}

/// Opens a FASTQ file, decompressing `.gz` transparently.
pub fn open_reader(path: &Path) -> Result<Box<dyn BufRead + Send>> {
    let file = File::open(path).map_err(|e| Error::io(path, e))?;

    if path.extension().and_then(|s| s.to_str()) == Some("gz") {
        let decoder = MultiGzDecoder::new(file);
        Ok(Box::new(BufReader::with_capacity(2 << 20, decoder)))
    } else {
        Ok(Box::new(BufReader::with_capacity(2 << 20, file)))
    }
}

/// Reads all records of `path`, parsing on a background thread.
///
/// `consume` is called on the caller's thread with each batch in file order.
/// The first error from either side stops the stream.
pub fn stream_fastq<F>(path: &Path, batch_size: usize, mut consume: F) -> Result<()>
where
    F: FnMut(Vec<FastqRecord>) -> Result<()>,
{
    let reader = open_reader(path)?;
    let (batch_tx, batch_rx): (Sender<Vec<FastqRecord>>, Receiver<Vec<FastqRecord>>) =
        bounded(PREFETCH_BATCHES);

    let owned: PathBuf = path.to_path_buf();
    let reader_handle = thread::spawn(move || -> Result<()> {
        let mut lines = reader.lines();
        loop {
            let batch = read_fastq_batch(&mut lines, batch_size, &owned)?;
            if batch.is_empty() {
                break;
            }
            if batch_tx.send(batch).is_err() {
                // consumer bailed out
                break;
            }
        }
        Ok(())
    });

    let mut consumed = Ok(());
    for batch in batch_rx.iter() {
        if let Err(e) = consume(batch) {
            consumed = Err(e);
            break;
        }
    }
    // 关闭通道，让读线程退出
    drop(batch_rx);

    let produced = reader_handle.join().map_err(|_| Error::ReaderPanic)?;
    consumed?;
    produced
}
