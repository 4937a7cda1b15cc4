//! Purpose: Move records between a directory and local files (export, backup, restore, import).
//! Exports: `Transfer`, `TransferConfig`, `TransferObserver`, `Silent`.
//! Role: Orchestrates the codec, archive, counter, and directory streams for one operation.
//! Invariants: Restore and import run one sender and one receiver; the first failure of either
//! role cancels the other and becomes the operation's result.
//! Invariants: Records with unknown fields are skipped and counted; every other read error is fatal.
//! Invariants: The observer sees a final summary exactly once, on success and on failure.
//! Invariants: Model kinds are replayed before data kinds so references resolve on the target.
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::directory::{Directory, ExportMessage, ExportOptions, ExportStream, ImportRequest, ImportStream};
use crate::core::archive::{ArchiveReader, ArchiveWriter, UnknownMembers};
use crate::core::codec::{CodecConfig, RecordReader, RecordWriter};
use crate::core::counter::{Counter, Item};
use crate::core::error::{Error, ErrorKind};
use crate::core::kind::RecordKind;
use crate::core::record::Record;
use crate::notice::Notice;

/// Receives progress and diagnostics while a transfer runs. Called from worker threads.
pub trait TransferObserver: Send + Sync {
    fn on_progress(&self, _item: &Item) {}
    fn on_notice(&self, _notice: &Notice) {}
    fn on_finish(&self, _counter: &Counter) {}
}

/// Observer that discards everything.
pub struct Silent;

impl TransferObserver for Silent {}

#[derive(Clone, Copy, Debug, Default)]
pub struct TransferConfig {
    pub codec: CodecConfig,
    pub unknown_members: UnknownMembers,
}

pub struct Transfer {
    config: TransferConfig,
    counter: Mutex<Arc<Counter>>,
    observer: Arc<dyn TransferObserver>,
}

impl Default for Transfer {
    fn default() -> Self {
        Self::new()
    }
}

/// Reports the summary when dropped, so early returns still produce one.
struct SummaryOnExit<'a> {
    counter: Arc<Counter>,
    observer: &'a dyn TransferObserver,
}

impl Drop for SummaryOnExit<'_> {
    fn drop(&mut self) {
        self.observer.on_finish(&self.counter);
    }
}

/// Shared cancellation and first-error slot for the two roles of an import.
struct Scope {
    cancel: watch::Sender<bool>,
    first: Mutex<Option<Error>>,
}

impl Scope {
    fn new() -> Self {
        let (cancel, _) = watch::channel(false);
        Self {
            cancel,
            first: Mutex::new(None),
        }
    }

    /// Keep the first real failure; a cancellation only wins if nothing else was reported.
    fn fail(&self, err: Error) {
        {
            let mut first = self.first.lock().unwrap_or_else(PoisonError::into_inner);
            let replace = match first.as_ref() {
                None => true,
                Some(prev) => {
                    prev.kind() == ErrorKind::Cancelled && err.kind() != ErrorKind::Cancelled
                }
            };
            if replace {
                *first = Some(err);
            }
        }
        self.cancel.send_replace(true);
    }

    fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.cancel.subscribe()
    }

    fn take_result(&self) -> Result<(), Error> {
        let first = self
            .first
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match first {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

fn cancelled_error() -> Error {
    Error::new(ErrorKind::Cancelled).with_message("import stream closed before all records were sent")
}

/// State handed to the blocking sender role.
struct SendContext {
    requests: mpsc::Sender<ImportRequest>,
    scope: Arc<Scope>,
    counter: Arc<Counter>,
    observer: Arc<dyn TransferObserver>,
    config: TransferConfig,
    cmd: &'static str,
}

impl SendContext {
    /// Send every record of one document; skip schema mismatches, stop on anything else.
    fn send_records<R: std::io::Read>(
        &self,
        reader: &mut RecordReader<R>,
        source: &str,
    ) -> Result<(), Error> {
        let item = self.counter.item(reader.kind());
        while let Some(result) = reader.next_record() {
            if self.scope.is_cancelled() {
                return Err(cancelled_error());
            }
            match result {
                Ok(record) => {
                    self.requests
                        .blocking_send(ImportRequest::set(record))
                        .map_err(|_| cancelled_error())?;
                    item.increment();
                    self.observer.on_progress(item);
                }
                Err(err) if err.is_schema_mismatch() => {
                    debug!(source, index = reader.index(), error = %err, "skipping record with unknown fields");
                    item.skip();
                }
                Err(err) => return Err(err.with_path(source)),
            }
        }
        if let Some(trailing) = reader.trailing() {
            self.observer.on_notice(
                &Notice::new(
                    "trailing_data",
                    self.cmd,
                    source,
                    "ignored data after the end of the record document",
                )
                .with_detail("snippet", trailing),
            );
        }
        Ok(())
    }
}

impl Transfer {
    pub fn new() -> Self {
        Self {
            config: TransferConfig::default(),
            counter: Mutex::new(Arc::new(Counter::new())),
            observer: Arc::new(Silent),
        }
    }

    pub fn with_config(mut self, config: TransferConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn TransferObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Counts of the most recent operation.
    pub fn counter(&self) -> Arc<Counter> {
        Arc::clone(&self.counter.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Start an operation with fresh counts; the guard reports them when dropped.
    fn begin(&self) -> SummaryOnExit<'_> {
        let counter = Arc::new(Counter::new());
        *self.counter.lock().unwrap_or_else(PoisonError::into_inner) = Arc::clone(&counter);
        SummaryOnExit {
            counter,
            observer: self.observer.as_ref(),
        }
    }

    fn notice(&self, notice: Notice) {
        warn!(kind = %notice.kind, source = %notice.source, "{}", notice.message);
        self.observer.on_notice(&notice);
    }

    /// Write objects and relations to two standalone record documents.
    pub async fn export<D: Directory>(
        &self,
        dir: &D,
        objects: impl AsRef<Path>,
        relations: impl AsRef<Path>,
    ) -> Result<(), Error> {
        let summary = self.begin();
        let mut objects_out = RecordWriter::create_path(objects.as_ref(), RecordKind::Object)?;
        let mut relations_out = RecordWriter::create_path(relations.as_ref(), RecordKind::Relation)?;
        let stream = dir.export(&ExportOptions::data())?;
        self.drain_export(stream, "export", &summary.counter, |record| match record.kind() {
            RecordKind::Object => objects_out.write(record).map(|()| true),
            RecordKind::Relation => relations_out.write(record).map(|()| true),
            _ => Ok(false),
        })
        .await?;
        objects_out.finish()?;
        relations_out.finish()?;
        info!(
            objects = summary.counter.objects().count(),
            relations = summary.counter.relations().count(),
            "export complete"
        );
        Ok(())
    }

    /// Write every kind into one compressed archive at `path`.
    pub async fn backup<D: Directory>(&self, dir: &D, path: impl Into<PathBuf>) -> Result<PathBuf, Error> {
        let summary = self.begin();
        let mut archive = ArchiveWriter::create(path, &RecordKind::ALL)?;
        let stream = dir.export(&ExportOptions::all())?;
        self.drain_export(stream, "backup", &summary.counter, |record| archive.write(record))
            .await?;
        let path = archive.finish()?;
        info!(path = %path.display(), "backup complete");
        Ok(path)
    }

    async fn drain_export<F>(
        &self,
        mut stream: ExportStream,
        cmd: &str,
        counter: &Counter,
        mut sink: F,
    ) -> Result<(), Error>
    where
        F: FnMut(&Record) -> Result<bool, Error>,
    {
        while let Some(message) = stream.messages.recv().await {
            let message = match message {
                Ok(message) => message,
                Err(err) if err.is_schema_mismatch() => {
                    if let Some(kind) = err.record() {
                        counter.item(kind).skip();
                    }
                    debug!(error = %err, "skipping exported record with unknown fields");
                    continue;
                }
                Err(err) => return Err(err),
            };
            let record = match message {
                ExportMessage::Unknown(tag) => {
                    self.notice(
                        Notice::new("unknown_message", cmd, "directory", "ignored unknown export message")
                            .with_detail("tag", tag),
                    );
                    continue;
                }
                known => match known.into_record() {
                    Some(record) => record,
                    None => continue,
                },
            };
            if sink(&record)? {
                let item = counter.item(record.kind());
                item.increment();
                self.observer.on_progress(item);
            } else {
                debug!(kind = ?record.kind(), "ignoring record kind not requested");
            }
        }
        Ok(())
    }

    /// Replay an archive written by `backup` into `dir`.
    pub async fn restore<D: Directory>(&self, dir: &D, path: impl Into<PathBuf>) -> Result<(), Error> {
        let summary = self.begin();
        let path = path.into();
        let archive = ArchiveReader::open(&path)?.with_unknown_members(self.config.unknown_members);
        let stream = dir.import()?;
        let counter = Arc::clone(&summary.counter);
        self.run_import(stream, "restore", counter, move |ctx| send_archive(ctx, archive))
            .await?;
        info!(path = %path.display(), "restore complete");
        Ok(())
    }

    /// Replay standalone record documents into `dir`, model kinds first.
    ///
    /// Every file's envelope is checked before anything is sent. Files that are not single-kind
    /// record documents are skipped with a notice; missing files are fatal.
    pub async fn import<D: Directory>(&self, dir: &D, files: &[PathBuf]) -> Result<(), Error> {
        let summary = self.begin();
        let mut readers = Vec::with_capacity(files.len());
        for file in files {
            let checked = RecordReader::open_path(file, self.config.codec)
                .and_then(|reader| reader.check_envelope().map_err(|err| err.with_path(file)))
                .and_then(|_| RecordReader::open_path(file, self.config.codec));
            match checked {
                Ok(reader) => readers.push((file.clone(), reader)),
                Err(err) if err.kind() == ErrorKind::Format => {
                    let mut notice = Notice::new(
                        "skipped_file",
                        "import",
                        file.display().to_string(),
                        "skipping file that is not a record document",
                    )
                    .with_detail("reason", err.message().unwrap_or("invalid document"));
                    if let Some(hint) = err.hint() {
                        notice = notice.with_detail("hint", hint);
                    }
                    self.notice(notice);
                }
                Err(err) => return Err(err),
            }
        }
        readers.sort_by_key(|(_, reader)| reader.kind());

        let stream = dir.import()?;
        let counter = Arc::clone(&summary.counter);
        self.run_import(stream, "import", counter, move |ctx| {
            for (file, mut reader) in readers {
                let source = file.display().to_string();
                debug!(file = %source, kind = ?reader.kind(), "importing file");
                ctx.send_records(&mut reader, &source)?;
            }
            Ok(())
        })
        .await?;
        info!(files = files.len(), "import complete");
        Ok(())
    }

    async fn run_import<F>(
        &self,
        stream: ImportStream,
        cmd: &'static str,
        counter: Arc<Counter>,
        send: F,
    ) -> Result<(), Error>
    where
        F: FnOnce(&SendContext) -> Result<(), Error> + Send + 'static,
    {
        let scope = Arc::new(Scope::new());
        let ImportStream {
            requests,
            mut acks,
            abort,
        } = stream;

        let ctx = SendContext {
            requests,
            scope: Arc::clone(&scope),
            counter,
            observer: Arc::clone(&self.observer),
            config: self.config,
            cmd,
        };
        let sender = tokio::task::spawn_blocking(move || {
            let result = send(&ctx);
            let SendContext { requests, scope, .. } = ctx;
            if let Err(err) = result {
                scope.fail(err);
                abort.abort();
            }
            // Closing the request side lets the directory finish and end the ack stream.
            drop(requests);
        });

        let receiver_scope = Arc::clone(&scope);
        let receiver = tokio::spawn(async move {
            let mut cancelled = receiver_scope.subscribe();
            let mut acked: u64 = 0;
            loop {
                if *cancelled.borrow_and_update() {
                    // A rejection already queued must not lose to the cancellation it caused.
                    while let Ok(ack) = acks.try_recv() {
                        match ack {
                            Ok(_) => acked += 1,
                            Err(err) => {
                                receiver_scope.fail(err);
                                break;
                            }
                        }
                    }
                    break;
                }
                tokio::select! {
                    ack = acks.recv() => match ack {
                        None => break,
                        Some(Ok(_)) => acked += 1,
                        Some(Err(err)) => {
                            receiver_scope.fail(err);
                            break;
                        }
                    },
                    changed = cancelled.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
            debug!(acked, "import acknowledgements drained");
        });

        let (sent, received) = tokio::join!(sender, receiver);
        for joined in [sent, received] {
            if let Err(err) = joined {
                scope.fail(
                    Error::new(ErrorKind::Internal)
                        .with_message("transfer task failed")
                        .with_source(err),
                );
            }
        }
        scope.take_result()
    }
}

fn send_archive(ctx: &SendContext, mut archive: ArchiveReader) -> Result<(), Error> {
    let archive_path = archive.path().display().to_string();
    let mut members = archive.members()?;
    for member in members.by_ref() {
        let member = member?;
        let source = format!("{archive_path}:{}", member.name());
        let mut reader = member.records(ctx.config.codec)?;
        ctx.send_records(&mut reader, &source)?;
    }
    for name in members.skipped() {
        ctx.observer.on_notice(&Notice::new(
            "skipped_member",
            ctx.cmd,
            format!("{archive_path}:{name}"),
            match ctx.config.unknown_members {
                UnknownMembers::Skip => "skipped unrecognized archive member",
                UnknownMembers::Stop => "stopped at unrecognized archive member",
            },
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::sync::mpsc;

    use super::{Transfer, cancelled_error};
    use crate::api::directory::{ImportAbort, ImportStream};
    use crate::core::counter::Counter;
    use crate::core::error::{Error, ErrorKind};

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn queued_rejection_beats_the_cancellation_it_caused() {
        let (requests, _request_rx) = mpsc::channel(4);
        let (ack_tx, acks) = mpsc::channel(4);
        ack_tx
            .send(Err(Error::new(ErrorKind::Service).with_message("rejected")))
            .await
            .unwrap();
        let abort = ImportAbort::new();
        let stream = ImportStream {
            requests,
            acks,
            abort: abort.clone(),
        };

        let err = Transfer::new()
            .run_import(stream, "import", Arc::new(Counter::new()), |_| Err(cancelled_error()))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Service);
        assert!(abort.is_aborted());
        drop(ack_tx);
    }

    #[tokio::test]
    async fn clean_sender_leaves_the_import_unaborted() {
        let (requests, mut request_rx) = mpsc::channel(4);
        let (ack_tx, acks) = mpsc::channel(4);
        let abort = ImportAbort::new();
        let stream = ImportStream {
            requests,
            acks,
            abort: abort.clone(),
        };
        let peer = tokio::spawn(async move {
            while request_rx.recv().await.is_some() {}
            drop(ack_tx);
        });

        Transfer::new()
            .run_import(stream, "import", Arc::new(Counter::new()), |_| Ok(()))
            .await
            .unwrap();
        peer.await.unwrap();
        assert!(!abort.is_aborted());
    }
}
