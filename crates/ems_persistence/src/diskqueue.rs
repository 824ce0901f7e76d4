//! Segmented disk-backed FIFO queue.
//!
//! Layout on disk, per queue `name`:
//!   `{name}.diskqueue.{:06}.dat`    append-only segments of
//!                                   `len(4, BE) || payload` records
//!   `{name}.diskqueue.meta.dat`     text metadata: depth, then
//!                                   `readFileNum,readPos`, then
//!                                   `writeFileNum,writePos`
//!
//! All file I/O happens on a single task per queue. The handle talks to
//! it over a command channel; reads are delivered through a capacity-1
//! channel so a record only leaves the disk when the consumer is ready
//! for it.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("message size {size} outside [{min}, {max}]")]
    InvalidSize { size: u32, min: u32, max: u32 },
    #[error("corrupt record in {file} at {pos}")]
    Corrupt { file: i64, pos: i64 },
    #[error("queue closed")]
    Closed,
}

#[derive(Debug, Clone)]
pub struct QueueOptions {
    pub max_bytes_per_file: i64,
    pub min_msg_size: u32,
    pub max_msg_size: u32,
    /// fsync after this many writes.
    pub sync_every: u64,
    /// fsync after this much write inactivity.
    pub sync_timeout: Duration,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            max_bytes_per_file: 100 * 1024 * 1024,
            min_msg_size: 0,
            max_msg_size: 1024 * 1024,
            sync_every: 2500,
            sync_timeout: Duration::from_secs(2),
        }
    }
}

enum Command {
    Put(Vec<u8>, oneshot::Sender<Result<(), QueueError>>),
    Empty(oneshot::Sender<Result<(), QueueError>>),
    Close(oneshot::Sender<Result<(), QueueError>>),
    Delete(oneshot::Sender<Result<(), QueueError>>),
}

/// Handle to a disk queue. Cheap to clone; all handles drive the same
/// I/O task.
#[derive(Clone)]
pub struct DiskQueue {
    name: String,
    cmd_tx: mpsc::UnboundedSender<Command>,
    depth: Arc<AtomicI64>,
    reader: Arc<Mutex<Option<mpsc::Receiver<Vec<u8>>>>>,
}

impl DiskQueue {
    /// Open (or create) the queue named `name` under `data_dir` and
    /// spawn its I/O task.
    pub fn new(
        name: impl Into<String>,
        data_dir: impl AsRef<Path>,
        opts: QueueOptions,
    ) -> Result<Self, QueueError> {
        let name = name.into();
        let data_dir = data_dir.as_ref().to_path_buf();
        fs::create_dir_all(&data_dir)?;

        let depth = Arc::new(AtomicI64::new(0));
        let mut inner = Inner {
            name: name.clone(),
            data_dir,
            opts,
            depth: Arc::clone(&depth),
            read_file_num: 0,
            read_pos: 0,
            write_file_num: 0,
            write_pos: 0,
            read_file: None,
            write_file: None,
            writes_since_sync: 0,
            needs_sync: false,
        };
        inner.retrieve_metadata()?;

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (read_tx, read_rx) = mpsc::channel(1);
        tokio::spawn(inner.io_loop(cmd_rx, read_tx));

        Ok(Self {
            name,
            cmd_tx,
            depth,
            reader: Arc::new(Mutex::new(Some(read_rx))),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of records between the read and write positions.
    pub fn depth(&self) -> i64 {
        self.depth.load(Ordering::Acquire)
    }

    /// The read side of the queue. Yields one record at a time, lazily.
    /// May be taken once; the owning pump holds it for the queue's life.
    pub fn take_reader(&self) -> Option<mpsc::Receiver<Vec<u8>>> {
        self.reader.lock().take()
    }

    pub async fn put(&self, data: Vec<u8>) -> Result<(), QueueError> {
        self.command(|ack| Command::Put(data, ack)).await
    }

    /// Discard every record and delete consumed segments.
    pub async fn empty(&self) -> Result<(), QueueError> {
        self.command(Command::Empty).await
    }

    /// Flush, persist metadata and stop the I/O task.
    pub async fn close(&self) -> Result<(), QueueError> {
        self.command(Command::Close).await
    }

    /// Stop the I/O task and remove every file of this queue.
    pub async fn delete(&self) -> Result<(), QueueError> {
        self.command(Command::Delete).await
    }

    async fn command<F>(&self, make: F) -> Result<(), QueueError>
    where
        F: FnOnce(oneshot::Sender<Result<(), QueueError>>) -> Command,
    {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.cmd_tx
            .send(make(ack_tx))
            .map_err(|_| QueueError::Closed)?;
        ack_rx.await.map_err(|_| QueueError::Closed)?
    }
}

struct Inner {
    name: String,
    data_dir: PathBuf,
    opts: QueueOptions,
    depth: Arc<AtomicI64>,

    read_file_num: i64,
    read_pos: i64,
    write_file_num: i64,
    write_pos: i64,

    read_file: Option<File>,
    write_file: Option<File>,

    writes_since_sync: u64,
    needs_sync: bool,
}

impl Inner {
    async fn io_loop(
        mut self,
        mut cmd_rx: mpsc::UnboundedReceiver<Command>,
        read_tx: mpsc::Sender<Vec<u8>>,
    ) {
        let mut sync_ticker = tokio::time::interval(self.opts.sync_timeout);
        sync_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut reader_gone = false;

        loop {
            let can_read = !reader_gone && self.has_pending_reads();
            tokio::select! {
                biased;

                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(Command::Put(data, ack)) => {
                            let res = self.write_one(&data);
                            if let Err(ref e) = res {
                                error!(queue = %self.name, error = %e, "disk queue put failed");
                            }
                            let _ = ack.send(res);
                        }
                        Some(Command::Empty(ack)) => {
                            let _ = ack.send(self.skip_to_next_rw_file());
                        }
                        Some(Command::Close(ack)) => {
                            let _ = ack.send(self.sync());
                            break;
                        }
                        Some(Command::Delete(ack)) => {
                            let _ = ack.send(self.remove_all_files());
                            break;
                        }
                        // all handles dropped: behave like close
                        None => {
                            if let Err(e) = self.sync() {
                                error!(queue = %self.name, error = %e, "sync on shutdown failed");
                            }
                            break;
                        }
                    }
                }

                permit = read_tx.reserve(), if can_read => {
                    match permit {
                        Ok(permit) => match self.read_one() {
                            Ok(data) => {
                                permit.send(data);
                                self.move_forward();
                            }
                            Err(e) => {
                                error!(queue = %self.name, error = %e, "read failed, skipping ahead");
                                self.handle_read_error();
                            }
                        },
                        Err(_) => reader_gone = true,
                    }
                }

                _ = sync_ticker.tick() => {
                    if self.needs_sync {
                        if let Err(e) = self.sync() {
                            error!(queue = %self.name, error = %e, "periodic sync failed");
                        }
                    }
                }
            }
        }
        debug!(queue = %self.name, "disk queue i/o loop exited");
    }

    fn has_pending_reads(&self) -> bool {
        self.read_file_num < self.write_file_num || self.read_pos < self.write_pos
    }

    fn file_name(&self, file_num: i64) -> PathBuf {
        self.data_dir
            .join(format!("{}.diskqueue.{:06}.dat", self.name, file_num))
    }

    fn meta_file_name(&self) -> PathBuf {
        self.data_dir
            .join(format!("{}.diskqueue.meta.dat", self.name))
    }

    fn write_one(&mut self, data: &[u8]) -> Result<(), QueueError> {
        let size = data.len() as u32;
        if size < self.opts.min_msg_size || size > self.opts.max_msg_size {
            return Err(QueueError::InvalidSize {
                size,
                min: self.opts.min_msg_size,
                max: self.opts.max_msg_size,
            });
        }

        let record_len = 4 + data.len() as i64;
        if self.write_pos > 0 && self.write_pos + record_len > self.opts.max_bytes_per_file {
            self.roll_write_file()?;
        }

        if self.write_file.is_none() {
            let path = self.file_name(self.write_file_num);
            let mut f = OpenOptions::new()
                .create(true)
                .write(true)
                .open(&path)?;
            if self.write_pos > 0 {
                f.seek(SeekFrom::Start(self.write_pos as u64))?;
            }
            debug!(queue = %self.name, file = %path.display(), "opened write segment");
            self.write_file = Some(f);
        }

        let f = self.write_file.as_mut().ok_or(QueueError::Closed)?;
        let mut buf = Vec::with_capacity(record_len as usize);
        buf.extend_from_slice(&size.to_be_bytes());
        buf.extend_from_slice(data);
        f.write_all(&buf)?;

        self.write_pos += record_len;
        self.depth.fetch_add(1, Ordering::AcqRel);
        self.writes_since_sync += 1;
        self.needs_sync = true;
        if self.writes_since_sync >= self.opts.sync_every {
            self.sync()?;
        }
        Ok(())
    }

    fn roll_write_file(&mut self) -> Result<(), QueueError> {
        self.sync()?;
        self.write_file = None;
        self.write_file_num += 1;
        self.write_pos = 0;
        Ok(())
    }

    fn read_one(&mut self) -> Result<Vec<u8>, QueueError> {
        loop {
            if self.read_file.is_none() {
                let path = self.file_name(self.read_file_num);
                let mut f = File::open(&path)?;
                if self.read_pos > 0 {
                    f.seek(SeekFrom::Start(self.read_pos as u64))?;
                }
                self.read_file = Some(f);
            }

            let f = self.read_file.as_mut().ok_or(QueueError::Closed)?;
            let mut len_buf = [0u8; 4];
            match f.read_exact(&mut len_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof
                    && self.read_file_num < self.write_file_num =>
                {
                    // end of a fully-consumed segment
                    self.advance_read_file();
                    continue;
                }
                Err(e) => return Err(e.into()),
            }

            let size = u32::from_be_bytes(len_buf);
            if size < self.opts.min_msg_size || size > self.opts.max_msg_size {
                return Err(QueueError::Corrupt {
                    file: self.read_file_num,
                    pos: self.read_pos,
                });
            }

            let mut data = vec![0u8; size as usize];
            f.read_exact(&mut data).map_err(|e| {
                if e.kind() == std::io::ErrorKind::UnexpectedEof {
                    QueueError::Corrupt {
                        file: self.read_file_num,
                        pos: self.read_pos,
                    }
                } else {
                    QueueError::Io(e)
                }
            })?;
            self.read_pos += 4 + size as i64;
            return Ok(data);
        }
    }

    /// Called after a record has been handed to the consumer.
    fn move_forward(&mut self) {
        let depth = self.depth.fetch_sub(1, Ordering::AcqRel) - 1;
        self.needs_sync = true;
        self.check_tail_corruption(depth);
    }

    fn advance_read_file(&mut self) {
        self.read_file = None;
        let old = self.file_name(self.read_file_num);
        if let Err(e) = fs::remove_file(&old) {
            warn!(queue = %self.name, file = %old.display(), error = %e, "removing consumed segment");
        }
        self.read_file_num += 1;
        self.read_pos = 0;
        self.needs_sync = true;
    }

    /// A corrupt record poisons the rest of its segment; jump past it
    /// rather than retry forever.
    fn handle_read_error(&mut self) {
        if self.read_file_num == self.write_file_num {
            // the bad record is in the active write segment; start fresh
            if let Err(e) = self.skip_to_next_rw_file() {
                error!(queue = %self.name, error = %e, "skip after corrupt tail failed");
            }
            return;
        }
        self.advance_read_file();
        if let Err(e) = self.sync() {
            error!(queue = %self.name, error = %e, "sync after read error failed");
        }
    }

    /// Skipped segments leave `depth` stale; force it once the reader
    /// has caught the writer.
    fn check_tail_corruption(&mut self, depth: i64) {
        if !self.has_pending_reads() && depth != 0 {
            error!(queue = %self.name, depth, "depth out of sync at tail, resetting");
            self.depth.store(0, Ordering::Release);
            self.needs_sync = true;
        }
    }

    fn skip_to_next_rw_file(&mut self) -> Result<(), QueueError> {
        self.read_file = None;
        self.write_file = None;

        for num in self.read_file_num..=self.write_file_num {
            let path = self.file_name(num);
            if path.exists() {
                if let Err(e) = fs::remove_file(&path) {
                    warn!(queue = %self.name, file = %path.display(), error = %e, "removing segment");
                }
            }
        }

        self.write_file_num += 1;
        self.write_pos = 0;
        self.read_file_num = self.write_file_num;
        self.read_pos = 0;
        self.depth.store(0, Ordering::Release);
        self.persist_metadata()?;
        Ok(())
    }

    fn remove_all_files(&mut self) -> Result<(), QueueError> {
        self.skip_to_next_rw_file()?;
        let meta = self.meta_file_name();
        if meta.exists() {
            fs::remove_file(meta)?;
        }
        Ok(())
    }

    fn sync(&mut self) -> Result<(), QueueError> {
        if let Some(f) = self.write_file.as_mut() {
            f.sync_data()?;
        }
        self.persist_metadata()?;
        self.writes_since_sync = 0;
        self.needs_sync = false;
        Ok(())
    }

    fn retrieve_metadata(&mut self) -> Result<(), QueueError> {
        let path = self.meta_file_name();
        let contents = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let mut lines = contents.lines();
        let parse = |s: Option<&str>| -> Option<Vec<i64>> {
            s.map(|l| l.split(',').filter_map(|p| p.trim().parse().ok()).collect())
        };
        let depth = parse(lines.next()).and_then(|v| v.first().copied());
        let read = parse(lines.next());
        let write = parse(lines.next());
        match (depth, read.as_deref(), write.as_deref()) {
            (Some(depth), Some([rf, rp]), Some([wf, wp])) => {
                self.depth.store(depth, Ordering::Release);
                self.read_file_num = *rf;
                self.read_pos = *rp;
                self.write_file_num = *wf;
                self.write_pos = *wp;
                Ok(())
            }
            _ => {
                error!(queue = %self.name, file = %path.display(), "malformed metadata, starting empty");
                Ok(())
            }
        }
    }

    fn persist_metadata(&mut self) -> Result<(), QueueError> {
        let path = self.meta_file_name();
        let tmp = self
            .data_dir
            .join(format!("{}.diskqueue.meta.dat.{}.tmp", self.name, std::process::id()));
        let contents = format!(
            "{}\n{},{}\n{},{}\n",
            self.depth.load(Ordering::Acquire),
            self.read_file_num,
            self.read_pos,
            self.write_file_num,
            self.write_pos
        );
        {
            let mut f = File::create(&tmp)?;
            f.write_all(contents.as_bytes())?;
            f.sync_data()?;
        }
        fs::rename(&tmp, &path)?;
        Ok(())
    }
}
