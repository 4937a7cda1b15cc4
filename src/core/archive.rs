//! Purpose: Pack per-kind record documents into one gzip tar archive and read them back.
//! Exports: `ArchiveWriter`, `ArchiveReader`, `Members`, `Member`, `UnknownMembers`.
//! Role: Archive codec for full backups; sits on top of the record codec.
//! Invariants: Each member holds exactly one kind and is named `<root_key>.json`.
//! Invariants: Staged member files live in a scratch dir that is removed on every exit path.
//! Invariants: The archive appears at its final path only after it is fully written.
//! Invariants: Reading is one forward pass; unknown members are skipped unless `Stop` is chosen.
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use tar::{Archive, Builder, Entries, Entry};
use tempfile::TempDir;
use tracing::{debug, warn};

use super::codec::{CodecConfig, RecordReader, RecordWriter};
use super::error::{Error, ErrorKind};
use super::kind::RecordKind;
use super::record::Record;

type ArchiveStream = GzDecoder<BufReader<File>>;

fn archive_error(err: std::io::Error, message: &str, path: &Path) -> Error {
    Error::new(ErrorKind::Io)
        .with_message(message)
        .with_path(path)
        .with_source(err)
}

/// What the reader does with a member whose name matches no record kind.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum UnknownMembers {
    #[default]
    Skip,
    /// End the scan at the first unrecognized member.
    Stop,
}

pub struct ArchiveWriter {
    path: PathBuf,
    sinks: Vec<RecordWriter<BufWriter<File>>>,
    scratch: TempDir,
}

impl ArchiveWriter {
    /// Stage one member per kind; members are appended in the order given.
    pub fn create(path: impl Into<PathBuf>, kinds: &[RecordKind]) -> Result<Self, Error> {
        let path = path.into();
        let scratch = tempfile::Builder::new()
            .prefix("dsmigrate-")
            .tempdir()
            .map_err(|err| archive_error(err, "failed to create scratch directory", &path))?;

        let mut sinks: Vec<RecordWriter<BufWriter<File>>> = Vec::new();
        for &kind in kinds {
            if sinks.iter().any(|sink| sink.kind() == kind) {
                continue;
            }
            sinks.push(RecordWriter::create_path(
                scratch.path().join(kind.file_name()),
                kind,
            )?);
        }
        debug!(path = %path.display(), members = sinks.len(), "staging archive");
        Ok(Self {
            path,
            sinks,
            scratch,
        })
    }

    pub fn kinds(&self) -> Vec<RecordKind> {
        self.sinks.iter().map(|sink| sink.kind()).collect()
    }

    /// Append a record to its kind's staged member; `false` when that kind was not requested.
    pub fn write(&mut self, record: &Record) -> Result<bool, Error> {
        let kind = record.kind();
        let Some(sink) = self.sinks.iter_mut().find(|sink| sink.kind() == kind) else {
            return Ok(false);
        };
        sink.write(record)?;
        Ok(true)
    }

    pub fn count(&self, kind: RecordKind) -> u64 {
        self.sinks
            .iter()
            .find(|sink| sink.kind() == kind)
            .map(|sink| sink.count())
            .unwrap_or(0)
    }

    /// Close every staged document and pack them into the archive.
    pub fn finish(self) -> Result<PathBuf, Error> {
        let Self {
            path,
            sinks,
            scratch,
        } = self;
        let mut staged = Vec::with_capacity(sinks.len());
        for sink in sinks {
            let kind = sink.kind();
            sink.finish()?;
            staged.push((kind, scratch.path().join(kind.file_name())));
        }

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)
                    .map_err(|err| archive_error(err, "failed to create archive directory", &path))?;
            }
        }

        let temp_path = path.with_extension("tmp");
        match pack(&staged, &temp_path) {
            Ok(()) => {
                fs::rename(&temp_path, &path)
                    .map_err(|err| archive_error(err, "failed to move archive into place", &path))?;
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path);
                return Err(err);
            }
        }
        debug!(path = %path.display(), "archive written");
        Ok(path)
    }
}

fn pack(staged: &[(RecordKind, PathBuf)], path: &Path) -> Result<(), Error> {
    let file = File::create(path).map_err(|err| archive_error(err, "failed to create archive", path))?;
    let encoder = GzEncoder::new(BufWriter::new(file), Compression::best());
    let mut builder = Builder::new(encoder);
    for (kind, staged_path) in staged {
        builder
            .append_path_with_name(staged_path, kind.file_name())
            .map_err(|err| {
                archive_error(err, "failed to append archive member", path).with_record(*kind)
            })?;
    }
    let encoder = builder
        .into_inner()
        .map_err(|err| archive_error(err, "failed to finish tar stream", path))?;
    let mut out = encoder
        .finish()
        .map_err(|err| archive_error(err, "failed to finish gzip stream", path))?;
    out.flush()
        .map_err(|err| archive_error(err, "failed to flush archive", path))?;
    Ok(())
}

pub struct ArchiveReader {
    path: PathBuf,
    archive: Archive<ArchiveStream>,
    unknown_members: UnknownMembers,
}

impl ArchiveReader {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, Error> {
        let path = path.into();
        let file = File::open(&path).map_err(|err| {
            let kind = if err.kind() == std::io::ErrorKind::NotFound {
                ErrorKind::NotFound
            } else {
                ErrorKind::Io
            };
            Error::new(kind)
                .with_message("failed to open archive")
                .with_path(&path)
                .with_source(err)
        })?;
        let archive = Archive::new(GzDecoder::new(BufReader::new(file)));
        Ok(Self {
            path,
            archive,
            unknown_members: UnknownMembers::default(),
        })
    }

    pub fn with_unknown_members(mut self, policy: UnknownMembers) -> Self {
        self.unknown_members = policy;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Iterate recognized regular-file members in stored order.
    pub fn members(&mut self) -> Result<Members<'_>, Error> {
        let entries = self
            .archive
            .entries()
            .map_err(|err| archive_error(err, "failed to read archive", &self.path))?;
        Ok(Members {
            path: self.path.clone(),
            entries,
            policy: self.unknown_members,
            skipped: Vec::new(),
            done: false,
        })
    }
}

pub struct Members<'a> {
    path: PathBuf,
    entries: Entries<'a, ArchiveStream>,
    policy: UnknownMembers,
    skipped: Vec<String>,
    done: bool,
}

impl Members<'_> {
    /// Names of members passed over because they matched no record kind.
    pub fn skipped(&self) -> &[String] {
        &self.skipped
    }
}

impl<'a> Iterator for Members<'a> {
    type Item = Result<Member<'a>, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            let entry = match self.entries.next()? {
                Ok(entry) => entry,
                Err(err) => {
                    self.done = true;
                    return Some(Err(archive_error(
                        err,
                        "failed to read archive member",
                        &self.path,
                    )));
                }
            };
            if !entry.header().entry_type().is_file() {
                continue;
            }
            let name = match entry.path() {
                Ok(name) => name.to_string_lossy().into_owned(),
                Err(err) => {
                    self.done = true;
                    return Some(Err(archive_error(
                        err,
                        "invalid archive member name",
                        &self.path,
                    )));
                }
            };
            match RecordKind::from_file_name(&name) {
                Some(kind) => return Some(Ok(Member { name, kind, entry })),
                None => match self.policy {
                    UnknownMembers::Skip => {
                        warn!(member = %name, "skipping unrecognized archive member");
                        self.skipped.push(name);
                    }
                    UnknownMembers::Stop => {
                        debug!(member = %name, "unrecognized archive member ends the scan");
                        self.skipped.push(name);
                        self.done = true;
                    }
                },
            }
        }
        None
    }
}

pub struct Member<'a> {
    name: String,
    kind: RecordKind,
    entry: Entry<'a, ArchiveStream>,
}

impl<'a> Member<'a> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> RecordKind {
        self.kind
    }

    pub fn size(&self) -> u64 {
        self.entry.header().size().unwrap_or(0)
    }

    /// Open the member's record stream; its root key must agree with the member name.
    pub fn records(self, config: CodecConfig) -> Result<RecordReader<Entry<'a, ArchiveStream>>, Error> {
        let name = self.name;
        let reader = RecordReader::open(self.entry, config).map_err(|err| err.with_path(&name))?;
        if reader.kind() != self.kind {
            return Err(Error::new(ErrorKind::Format)
                .with_message(format!(
                    "member holds `{}` records but is named for `{}`",
                    reader.kind().root_key(),
                    self.kind.root_key()
                ))
                .with_path(name));
        }
        Ok(reader)
    }
}
