//! Purpose: Stream records in and out of `{"<root_key>": [ ... ]}` JSON documents.
//! Exports: `CodecConfig`, `RecordReader`, `RecordWriter`.
//! Role: Record codec shared by archive members, plain export files, and import files.
//! Invariants: The root key alone decides the record kind; a document never mixes kinds.
//! Invariants: No unbounded buffering; one record at a time, capped by `max_record_bytes`.
//! Invariants: Content after the closing `}` is a warning (see `trailing`), never a failure;
//! a second root key is a format error.
//! Invariants: Unknown fields surface as `ErrorKind::Schema` and leave the reader positioned
//! at the next record, so callers may skip and continue.
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;

use bstr::ByteSlice;
use serde_json::Value;
use tracing::warn;

use super::error::{Error, ErrorKind};
use super::kind::RecordKind;
use super::record::Record;

const DEFAULT_MAX_RECORD_BYTES: usize = 16 * 1024 * 1024;
const MAX_SNIPPET_BYTES: usize = 64;

#[derive(Copy, Clone, Debug)]
pub struct CodecConfig {
    pub max_record_bytes: usize,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            max_record_bytes: DEFAULT_MAX_RECORD_BYTES,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum ReadState {
    First,
    Rest,
    Done,
}

pub struct RecordReader<R> {
    input: BufReader<R>,
    kind: RecordKind,
    config: CodecConfig,
    index: u64,
    state: ReadState,
    trailing: Option<String>,
}

fn io_error(err: io::Error, message: &str) -> Error {
    Error::new(ErrorKind::Io)
        .with_message(message)
        .with_source(err)
}

fn format_error(message: impl Into<String>) -> Error {
    Error::new(ErrorKind::Format).with_message(message)
}

impl RecordReader<File> {
    pub fn open_path(path: impl AsRef<Path>, config: CodecConfig) -> Result<Self, Error> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|err| {
            let kind = if err.kind() == io::ErrorKind::NotFound {
                ErrorKind::NotFound
            } else {
                ErrorKind::Io
            };
            Error::new(kind)
                .with_message("failed to open file")
                .with_path(path)
                .with_source(err)
        })?;
        Self::open(file, config).map_err(|err| err.with_path(path))
    }
}

impl<R: Read> RecordReader<R> {
    /// Consume the document header and identify the record kind from its root key.
    pub fn open(input: R, config: CodecConfig) -> Result<Self, Error> {
        let mut input = BufReader::new(input);
        match next_token(&mut input)? {
            Some(b'{') => bump(&mut input),
            Some(b'[') => {
                return Err(format_error("document is a bare JSON array")
                    .with_hint("Wrap the array in an object keyed by kind, e.g. {\"objects\": [...]}."));
            }
            Some(other) => {
                return Err(format_error(format!(
                    "document does not start with an object (found {:?})",
                    other as char
                )));
            }
            None => return Err(format_error("document is empty")),
        }

        if next_token(&mut input)? != Some(b'"') {
            return Err(format_error("document object has no root key"));
        }
        let mut raw_key = Vec::new();
        scan_string(&mut input, &mut raw_key, config.max_record_bytes)?;
        let key: String = serde_json::from_slice(&raw_key).map_err(|err| {
            Error::new(ErrorKind::Format)
                .with_message("invalid root key")
                .with_source(err)
        })?;

        if next_token(&mut input)? != Some(b':') {
            return Err(format_error(format!("expected ':' after root key `{key}`")));
        }
        bump(&mut input);

        if next_token(&mut input)? != Some(b'[') {
            return Err(format_error(format!(
                "value of root key `{key}` is not a JSON array"
            )));
        }
        bump(&mut input);

        let kind = RecordKind::from_root_key(&key).ok_or_else(|| {
            format_error(format!("unrecognized root key `{key}`")).with_hint(
                "Expected one of object_types, permissions, relation_types, objects, relations.",
            )
        })?;

        Ok(Self {
            input,
            kind,
            config,
            index: 0,
            state: ReadState::First,
            trailing: None,
        })
    }

    pub fn kind(&self) -> RecordKind {
        self.kind
    }

    /// Records seen so far, including ones that failed to decode.
    pub fn index(&self) -> u64 {
        self.index
    }

    /// Snippet of unexpected content found after the array, once the array is exhausted.
    pub fn trailing(&self) -> Option<&str> {
        self.trailing.as_deref()
    }

    pub fn next_record(&mut self) -> Option<Result<Record, Error>> {
        if self.state == ReadState::Done {
            return None;
        }
        match self.read_next() {
            Ok(Some(value)) => Some(
                Record::decode(self.kind, value).map_err(|err| err.with_index(self.index)),
            ),
            Ok(None) => None,
            Err(err) => {
                self.state = ReadState::Done;
                Some(Err(err.with_record(self.kind).with_index(self.index)))
            }
        }
    }

    /// Walk the rest of the document without decoding records, checking only its shape.
    ///
    /// Returns the number of array elements. Record contents are left to `next_record`.
    pub fn check_envelope(mut self) -> Result<u64, Error> {
        while self.read_raw()?.is_some() {}
        Ok(self.index)
    }

    fn read_next(&mut self) -> Result<Option<Value>, Error> {
        let Some(raw) = self.read_raw()? else {
            return Ok(None);
        };
        let value = serde_json::from_slice::<Value>(&raw).map_err(|err| {
            Error::new(ErrorKind::Format)
                .with_message("invalid record json")
                .with_source(err)
        })?;
        Ok(Some(value))
    }

    fn read_raw(&mut self) -> Result<Option<Vec<u8>>, Error> {
        if self.state == ReadState::Done {
            return Ok(None);
        }
        let Some(byte) = next_token(&mut self.input)? else {
            return Err(format_error("unexpected end of input inside array"));
        };
        if byte == b']' {
            bump(&mut self.input);
            self.finish_document()?;
            self.state = ReadState::Done;
            return Ok(None);
        }
        if self.state == ReadState::Rest {
            if byte != b',' {
                return Err(format_error(format!(
                    "expected ',' or ']' between records (found {:?})",
                    byte as char
                )));
            }
            bump(&mut self.input);
        } else if byte == b',' {
            return Err(format_error("array starts with ','"));
        }
        self.state = ReadState::Rest;
        self.index += 1;

        if next_token(&mut self.input)?.is_none() {
            return Err(format_error("unexpected end of input inside array"));
        }
        let mut raw = Vec::new();
        scan_value(&mut self.input, &mut raw, self.config.max_record_bytes)?;
        Ok(Some(raw))
    }

    fn finish_document(&mut self) -> Result<(), Error> {
        match next_token(&mut self.input)? {
            Some(b'}') => {
                bump(&mut self.input);
                if next_token(&mut self.input)?.is_some() {
                    self.note_trailing()?;
                }
            }
            Some(b',') => {
                return Err(format_error("document has more than one root key").with_hint(
                    "Split the document so each file holds a single kind.",
                ));
            }
            Some(other) => {
                return Err(format_error(format!(
                    "expected '}}' after record array (found {:?})",
                    other as char
                )));
            }
            None => {
                warn!(kind = self.kind.root_key(), "document ended without closing brace");
            }
        }
        Ok(())
    }

    fn note_trailing(&mut self) -> Result<(), Error> {
        let mut snippet = Vec::new();
        (&mut self.input)
            .take(MAX_SNIPPET_BYTES as u64)
            .read_to_end(&mut snippet)
            .map_err(|err| io_error(err, "failed to read trailing data"))?;
        let text = snippet.to_str_lossy().trim().to_string();
        warn!(
            kind = self.kind.root_key(),
            trailing = %text,
            "detected additional data after record array, ignoring"
        );
        self.trailing = Some(text);
        Ok(())
    }
}

impl<R: Read> Iterator for RecordReader<R> {
    type Item = Result<Record, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_record()
    }
}

fn peek<R: Read>(input: &mut BufReader<R>) -> Result<Option<u8>, Error> {
    let buf = input
        .fill_buf()
        .map_err(|err| io_error(err, "failed to read record stream"))?;
    Ok(buf.first().copied())
}

fn bump<R: Read>(input: &mut BufReader<R>) {
    input.consume(1);
}

/// Skip whitespace and return the next significant byte without consuming it.
fn next_token<R: Read>(input: &mut BufReader<R>) -> Result<Option<u8>, Error> {
    loop {
        match peek(input)? {
            Some(b' ' | b'\t' | b'\n' | b'\r') => bump(input),
            other => return Ok(other),
        }
    }
}

fn take_byte<R: Read>(input: &mut BufReader<R>) -> Result<u8, Error> {
    let byte = peek(input)?.ok_or_else(|| format_error("unexpected end of input inside record"))?;
    bump(input);
    Ok(byte)
}

fn check_size(len: usize, max_bytes: usize) -> Result<(), Error> {
    if len > max_bytes {
        return Err(format_error("record exceeds size limit")
            .with_hint("Raise the record size limit or split the record."));
    }
    Ok(())
}

/// Copy one quoted string (including quotes) into `out`; the cursor must sit on the opening quote.
fn scan_string<R: Read>(
    input: &mut BufReader<R>,
    out: &mut Vec<u8>,
    max_bytes: usize,
) -> Result<(), Error> {
    out.push(take_byte(input)?);
    let mut escaped = false;
    loop {
        let byte = take_byte(input)?;
        out.push(byte);
        check_size(out.len(), max_bytes)?;
        if escaped {
            escaped = false;
        } else if byte == b'\\' {
            escaped = true;
        } else if byte == b'"' {
            return Ok(());
        }
    }
}

/// Copy exactly one JSON value into `out` without interpreting it.
fn scan_value<R: Read>(
    input: &mut BufReader<R>,
    out: &mut Vec<u8>,
    max_bytes: usize,
) -> Result<(), Error> {
    let check = |len: usize| check_size(len, max_bytes);

    match peek(input)? {
        Some(b'"') => scan_string(input, out, max_bytes),
        Some(b'{' | b'[') => {
            let mut depth = 0usize;
            loop {
                match peek(input)? {
                    Some(b'"') => scan_string(input, out, max_bytes)?,
                    Some(byte) => {
                        bump(input);
                        out.push(byte);
                        match byte {
                            b'{' | b'[' => depth += 1,
                            b'}' | b']' => {
                                depth -= 1;
                                if depth == 0 {
                                    return check(out.len());
                                }
                            }
                            _ => {}
                        }
                    }
                    None => return Err(format_error("unexpected end of input inside record")),
                }
                check(out.len())?;
            }
        }
        Some(_) => {
            while let Some(byte) = peek(input)? {
                if matches!(byte, b',' | b']' | b'}' | b' ' | b'\t' | b'\n' | b'\r') {
                    break;
                }
                bump(input);
                out.push(byte);
                check(out.len())?;
            }
            Ok(())
        }
        None => Err(format_error("unexpected end of input inside array")),
    }
}

/// Writes one `{"<root_key>": [...]}` document, one record per line.
pub struct RecordWriter<W: Write> {
    out: Option<W>,
    kind: RecordKind,
    count: u64,
}

impl RecordWriter<BufWriter<File>> {
    pub fn create_path(path: impl AsRef<Path>, kind: RecordKind) -> Result<Self, Error> {
        let path = path.as_ref();
        let file = File::create(path).map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to create file")
                .with_path(path)
                .with_source(err)
        })?;
        Self::new(BufWriter::new(file), kind).map_err(|err| err.with_path(path))
    }
}

impl<W: Write> RecordWriter<W> {
    pub fn new(mut out: W, kind: RecordKind) -> Result<Self, Error> {
        write!(out, "{{\"{}\":[", kind.root_key())
            .map_err(|err| io_error(err, "failed to write document header"))?;
        Ok(Self {
            out: Some(out),
            kind,
            count: 0,
        })
    }

    pub fn kind(&self) -> RecordKind {
        self.kind
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn write(&mut self, record: &Record) -> Result<(), Error> {
        if record.kind() != self.kind {
            return Err(Error::new(ErrorKind::Internal)
                .with_message(format!(
                    "cannot write {} into a {} document",
                    record.kind().root_key(),
                    self.kind.root_key()
                ))
                .with_record(record.kind()));
        }
        let value = record.to_value()?;
        let Some(out) = self.out.as_mut() else {
            return Err(Error::new(ErrorKind::Internal).with_message("record writer is closed"));
        };
        let separator: &[u8] = if self.count == 0 { b"\n" } else { b",\n" };
        out.write_all(separator)
            .map_err(|err| io_error(err, "failed to write record"))?;
        serde_json::to_writer(&mut *out, &value).map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to write record")
                .with_record(self.kind)
                .with_source(err)
        })?;
        self.count += 1;
        Ok(())
    }

    /// Close the array and object and hand back the flushed sink.
    pub fn finish(mut self) -> Result<W, Error> {
        let mut out = self
            .out
            .take()
            .ok_or_else(|| Error::new(ErrorKind::Internal).with_message("record writer is closed"))?;
        close_document(&mut out, self.count)?;
        Ok(out)
    }
}

fn close_document<W: Write>(out: &mut W, count: u64) -> Result<(), Error> {
    let tail: &[u8] = if count == 0 { b"]}\n" } else { b"\n]}\n" };
    out.write_all(tail)
        .and_then(|_| out.flush())
        .map_err(|err| io_error(err, "failed to close document"))
}

impl<W: Write> Drop for RecordWriter<W> {
    fn drop(&mut self) {
        if let Some(mut out) = self.out.take() {
            let _ = close_document(&mut out, self.count);
        }
    }
}
