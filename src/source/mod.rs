use csv::{ReaderBuilder, StringRecord};
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const DEFAULT_DELIMITER: u8 = b',';
pub const DEFAULT_SEPARATOR: &str = " ";

#[derive(Debug, Clone)]
pub struct TranslatorOptions {
    /// Field delimiter in the input file.
    pub delimiter: u8,
    /// Placed between fields in the resulting payload.
    pub separator: String,
    /// Records with a different field count are malformed. `None` accepts any.
    pub expected_fields: Option<usize>,
}

impl Default for TranslatorOptions {
    fn default() -> Self {
        Self {
            delimiter: DEFAULT_DELIMITER,
            separator: DEFAULT_SEPARATOR.to_string(),
            expected_fields: None,
        }
    }
}

/// One input record turned into a payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceRecord {
    /// 1-based position among the records of the source.
    pub index: u64,
    /// Line the record was read from.
    pub line: u64,
    pub payload: Vec<u8>,
}

/// Lazily turns the lines of a delimited file into message payloads.
///
/// Every physical line is one record: the source has no header row, and a
/// blank line is a record with no fields and an empty payload. Quoted fields
/// cannot span lines. Iteration is single-pass; to start over, open the
/// source again. An I/O failure ends the sequence, while a malformed record
/// yields an error and iteration may continue past it.
pub struct RowTranslator<R> {
    input: BufReader<R>,
    parser: ReaderBuilder,
    line: Vec<u8>,
    options: TranslatorOptions,
    index: u64,
    finished: bool,
}

impl RowTranslator<File> {
    pub fn open(path: &Path, options: TranslatorOptions) -> Result<Self, SourceReadError> {
        let file = File::open(path).map_err(|e| SourceReadError::Open {
            path: path.to_path_buf(),
            source: e,
        })?;

        info!(
            path = %path.display(),
            delimiter = %char::from(options.delimiter),
            expected_fields = ?options.expected_fields,
            "Opened input source"
        );

        Ok(Self::from_reader(file, options))
    }
}

impl<R: Read> RowTranslator<R> {
    pub fn from_reader(reader: R, options: TranslatorOptions) -> Self {
        let mut parser = ReaderBuilder::new();
        parser
            .has_headers(false)
            .flexible(true)
            .delimiter(options.delimiter);

        Self {
            input: BufReader::new(reader),
            parser,
            line: Vec::new(),
            options,
            index: 0,
            finished: false,
        }
    }

    /// Number of records consumed so far, malformed ones included.
    pub fn records_read(&self) -> u64 {
        self.index
    }

    fn parse_fields(&self) -> Result<StringRecord, csv::Error> {
        let mut fields = StringRecord::new();
        let raw = strip_line_ending(&self.line);
        if !raw.is_empty() {
            self.parser.from_reader(raw).read_record(&mut fields)?;
        }
        Ok(fields)
    }

    fn translate(&self) -> Result<SourceRecord, SourceReadError> {
        let line = self.index;

        let fields = self.parse_fields().map_err(|e| SourceReadError::Malformed {
            index: self.index,
            line: Some(line),
            reason: e.to_string(),
        })?;

        if let Some(expected) = self.options.expected_fields {
            if fields.len() != expected {
                return Err(SourceReadError::Malformed {
                    index: self.index,
                    line: Some(line),
                    reason: format!("expected {} fields, found {}", expected, fields.len()),
                });
            }
        }

        let payload = fields
            .iter()
            .collect::<Vec<_>>()
            .join(self.options.separator.as_str());

        debug!(record = self.index, line, fields = fields.len(), "Translated record");

        Ok(SourceRecord {
            index: self.index,
            line,
            payload: payload.into_bytes(),
        })
    }
}

fn strip_line_ending(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

impl<R: Read> Iterator for RowTranslator<R> {
    type Item = Result<SourceRecord, SourceReadError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        self.line.clear();
        match self.input.read_until(b'\n', &mut self.line) {
            Ok(0) => {
                self.finished = true;
                None
            }
            Ok(_) => {
                self.index += 1;
                Some(self.translate())
            }
            Err(e) => {
                self.index += 1;
                self.finished = true;
                Some(Err(SourceReadError::Io {
                    index: self.index,
                    reason: e.to_string(),
                }))
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SourceReadError {
    #[error("Failed to open input {}: {source}", .path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Record {index} is malformed: {reason}")]
    Malformed {
        index: u64,
        line: Option<u64>,
        reason: String,
    },

    #[error("Failed to read record {index}: {reason}")]
    Io { index: u64, reason: String },
}

impl SourceReadError {
    pub fn index(&self) -> Option<u64> {
        match self {
            Self::Open { .. } => None,
            Self::Malformed { index, .. } | Self::Io { index, .. } => Some(*index),
        }
    }

    /// Errors after which no further record can be read.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Malformed { .. })
    }
}
