//! Fetching and parsing of tabular import sources.
//!
//! A source is either a remote share link fetched through a [`RemoteFetcher`]
//! or a file below the configured local import root. Both end up as a
//! [`ParsedTable`]: the header row, an eager preview sample and a lazy stream
//! of the remaining data rows.

mod remote;
mod rows;

use std::fs::{self, File};
use std::io::{BufReader, Cursor, Read};
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::SourceError;
use crate::model::{ImportConfiguration, SourceKind};
use crate::util::sha256_bytes;

pub use remote::{HttpFetcher, RemoteFetcher, normalize_remote_url};
pub use rows::{RowIssue, RowStream};

pub const DEFAULT_SAMPLE_ROWS: usize = 50;

pub struct ParsedTable {
    pub headers: Vec<String>,
    pub sample: Vec<Vec<String>>,
    /// Number of data records in the source when it was counted up front.
    pub total_hint: Option<u64>,
    pub source_sha256: Option<String>,
    rows: RowStream,
}

impl ParsedTable {
    pub fn rows(&mut self) -> &mut RowStream {
        &mut self.rows
    }

    pub fn parse_errors(&self) -> u64 {
        self.rows.parse_errors()
    }

    pub fn issues(&self) -> &[RowIssue] {
        self.rows.issues()
    }
}

pub struct SourceReader<'a> {
    fetcher: &'a dyn RemoteFetcher,
    local_root: PathBuf,
    credentials: Option<String>,
    delimiter: char,
    sample_rows: usize,
}

impl<'a> SourceReader<'a> {
    pub fn new(fetcher: &'a dyn RemoteFetcher, config: &ImportConfiguration) -> Self {
        Self {
            fetcher,
            local_root: config.local_root.clone(),
            credentials: config.remote_token.clone(),
            delimiter: config.delimiter,
            sample_rows: if config.sample_rows == 0 {
                DEFAULT_SAMPLE_ROWS
            } else {
                config.sample_rows
            },
        }
    }

    /// Rows kept for the preview sample; 0 in the settings means the default.
    pub fn sample_rows(&self) -> usize {
        self.sample_rows
    }

    /// Opens `location` and parses its header plus the preview sample.
    ///
    /// With `limit_rows` set the stream stops after that many valid rows and
    /// no up-front row count or fingerprint is taken; that mode backs the
    /// column preview. Without a limit the source is counted and hashed first
    /// so a run can report a total.
    pub fn read(
        &self,
        kind: SourceKind,
        location: &str,
        limit_rows: Option<usize>,
    ) -> Result<ParsedTable, SourceError> {
        let location = location.trim();
        if location.is_empty() {
            return Err(SourceError::NotFound(format!("no {kind} source location configured")));
        }

        let delimiter = delimiter_byte(self.delimiter)?;
        let full_read = limit_rows.is_none();

        let (input, total_hint, source_sha256): (Box<dyn Read>, Option<u64>, Option<String>) =
            match (kind, full_read) {
                (SourceKind::Remote, _) => {
                    let bytes = self.fetcher.fetch(location, self.credentials.as_deref())?;
                    info!(source = %kind, bytes = bytes.len(), "fetched remote source");
                    let (total, digest) = fingerprint(&bytes, delimiter, full_read);
                    (Box::new(Cursor::new(bytes)), total, digest)
                }
                (SourceKind::Local, true) => {
                    // Counted, hashed and parsed from the same bytes.
                    let path = resolve_local_path(&self.local_root, location)?;
                    let bytes =
                        fs::read(&path).map_err(|err| SourceError::from_io(err, location))?;
                    debug!(path = %path.display(), bytes = bytes.len(), "loaded local source");
                    let (total, digest) = fingerprint(&bytes, delimiter, full_read);
                    (Box::new(Cursor::new(bytes)), total, digest)
                }
                (SourceKind::Local, false) => {
                    let path = resolve_local_path(&self.local_root, location)?;
                    let file =
                        File::open(&path).map_err(|err| SourceError::from_io(err, location))?;
                    debug!(path = %path.display(), "opened local source");
                    (Box::new(BufReader::new(file)), None, None)
                }
            };

        let mut reader = csv::ReaderBuilder::new()
            .delimiter(delimiter)
            .has_headers(true)
            .flexible(true)
            .from_reader(input);

        let headers = reader
            .headers()
            .map_err(|err| SourceError::Malformed(format!("unreadable header row: {err}")))?
            .iter()
            .enumerate()
            .map(|(index, cell)| {
                let cell = if index == 0 { cell.trim_start_matches('\u{feff}') } else { cell };
                cell.to_string()
            })
            .collect::<Vec<_>>();

        if headers.is_empty() || headers.iter().all(|header| header.trim().is_empty()) {
            return Err(SourceError::Malformed(format!("{location} has no header row")));
        }

        let mut rows = RowStream::new(reader.into_records(), headers.len(), limit_rows);
        let sample = rows.prefetch(self.sample_rows);

        info!(
            source = %kind,
            columns = headers.len(),
            sample_rows = sample.len(),
            total_hint = total_hint.unwrap_or(0),
            "parsed source header"
        );

        Ok(ParsedTable {
            headers,
            sample,
            total_hint,
            source_sha256,
            rows,
        })
    }

    /// Cheap existence/reachability check used by the config validator.
    pub fn probe(&self, kind: SourceKind, location: &str) -> Result<(), SourceError> {
        let location = location.trim();
        match kind {
            SourceKind::Remote => self.fetcher.probe(location, self.credentials.as_deref()),
            SourceKind::Local => {
                let path = resolve_local_path(&self.local_root, location)?;
                File::open(&path)
                    .map(|_| ())
                    .map_err(|err| SourceError::from_io(err, location))
            }
        }
    }
}

/// Canonicalizes `location` against `root` and rejects anything that resolves
/// outside of it.
pub fn resolve_local_path(root: &Path, location: &str) -> Result<PathBuf, SourceError> {
    let root = root
        .canonicalize()
        .map_err(|err| SourceError::from_io(err, &root.display().to_string()))?;

    let candidate = Path::new(location);
    let joined = if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        root.join(candidate)
    };

    let resolved = joined
        .canonicalize()
        .map_err(|err| SourceError::from_io(err, location))?;

    if !resolved.starts_with(&root) {
        return Err(SourceError::OutsideRoot(location.to_string()));
    }
    if !resolved.is_file() {
        return Err(SourceError::NotFound(format!("{location} is not a file")));
    }

    Ok(resolved)
}

fn delimiter_byte(delimiter: char) -> Result<u8, SourceError> {
    if delimiter.is_ascii() && !matches!(delimiter, '"' | '\n' | '\r') {
        Ok(delimiter as u8)
    } else {
        Err(SourceError::Malformed(format!(
            "unsupported field delimiter {delimiter:?}"
        )))
    }
}

fn fingerprint(bytes: &[u8], delimiter: u8, full_read: bool) -> (Option<u64>, Option<String>) {
    if full_read {
        (Some(count_records(bytes, delimiter)), Some(sha256_bytes(bytes)))
    } else {
        (None, None)
    }
}

fn count_records<R: Read>(input: R, delimiter: u8) -> u64 {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(true)
        .flexible(true)
        .from_reader(input);

    let mut record = csv::ByteRecord::new();
    let mut count = 0_u64;
    loop {
        match reader.read_byte_record(&mut record) {
            Ok(true) => count += 1,
            Ok(false) => break,
            Err(err) if err.is_io_error() => break,
            Err(_) => count += 1,
        }
    }
    count
}
