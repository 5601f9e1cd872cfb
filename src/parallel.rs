//! LZMA2 stream reader and writer with a parallel scheduler.
//!
//! The writer segments its input into worker-buffer-sized tasks, each
//! encoded as an independent run of chunks opening with a full reset.
//! Workers are spawned lazily up to the configured count and never touch
//! the sink: a dedicated sink thread drains a FIFO of one-shot result
//! channels in submission order, so output bytes are identical for every
//! worker count.
//!
//! The reader scans chunk headers without decompressing and accumulates
//! runs that end at dictionary-reset boundaries; complete runs of known
//! output size go to workers, and a stream section with no reset boundary
//! inside one worker buffer is decoded serially instead. Ordered output
//! again flows through a FIFO of result channels.
//!
//! Errors propagate through a single-slot channel; the first error wins,
//! cancels the shared flag and is latched by the facade.

use crate::error::{LzmaError, Result};
use crate::lzma2::{ChunkHeader, ChunkReader, encode_segment};
use crate::model::Properties;
use std::io::{self, Cursor, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, SyncSender, TryRecvError, sync_channel};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

/// Default worker buffer: 1 MiB of uncompressed data per task.
pub const DEFAULT_WORKER_BUFFER_SIZE: usize = 1 << 20;

/// Default dictionary size: 8 MiB.
pub const DEFAULT_DICT_SIZE: u32 = 8 << 20;

fn host_parallelism() -> usize {
    thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}

/// Configuration for [`Lzma2Writer`].
#[derive(Debug, Clone, Copy)]
pub struct Lzma2WriterConfig {
    /// Dictionary size, default 8 MiB.
    pub dict_size: u32,
    /// LZMA properties, default `{3, 0, 2}`.
    pub props: Properties,
    /// Number of workers; 0 selects the host parallelism.
    pub workers: usize,
    /// Uncompressed bytes handed to a worker per task, default 1 MiB.
    pub worker_buffer_size: usize,
}

impl Default for Lzma2WriterConfig {
    fn default() -> Self {
        Self {
            dict_size: DEFAULT_DICT_SIZE,
            props: Properties::default(),
            workers: 0,
            worker_buffer_size: DEFAULT_WORKER_BUFFER_SIZE,
        }
    }
}

impl Lzma2WriterConfig {
    /// Set the dictionary size.
    #[must_use]
    pub fn dict_size(mut self, dict_size: u32) -> Self {
        self.dict_size = dict_size;
        self
    }

    /// Set the LZMA properties.
    #[must_use]
    pub fn props(mut self, props: Properties) -> Self {
        self.props = props;
        self
    }

    /// Set the worker count; 0 selects the host parallelism.
    #[must_use]
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Set the per-task buffer size.
    #[must_use]
    pub fn worker_buffer_size(mut self, size: usize) -> Self {
        self.worker_buffer_size = size;
        self
    }

    fn resolved(mut self) -> Result<Self> {
        if self.workers == 0 {
            self.workers = host_parallelism();
        }
        self.props.verify()?;
        if self.dict_size < crate::dict::MIN_DICT_SIZE {
            return Err(LzmaError::invalid_header(format!(
                "dictionary size must be at least {} bytes",
                crate::dict::MIN_DICT_SIZE
            )));
        }
        if self.worker_buffer_size == 0 {
            return Err(LzmaError::invalid_header(
                "worker_buffer_size must be greater than 0",
            ));
        }
        Ok(self)
    }
}

/// Configuration for [`Lzma2Reader`].
#[derive(Debug, Clone, Copy)]
pub struct Lzma2ReaderConfig {
    /// Dictionary size, default 8 MiB. Must cover the encoder's window.
    pub dict_size: u32,
    /// Number of workers, default 1 (serial decoding).
    pub workers: usize,
    /// Uncompressed bytes accumulated per task, default 1 MiB.
    pub worker_buffer_size: usize,
}

impl Default for Lzma2ReaderConfig {
    fn default() -> Self {
        Self {
            dict_size: DEFAULT_DICT_SIZE,
            workers: 1,
            worker_buffer_size: DEFAULT_WORKER_BUFFER_SIZE,
        }
    }
}

impl Lzma2ReaderConfig {
    /// Set the dictionary size.
    #[must_use]
    pub fn dict_size(mut self, dict_size: u32) -> Self {
        self.dict_size = dict_size;
        self
    }

    /// Set the worker count.
    #[must_use]
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Set the per-task buffer size.
    #[must_use]
    pub fn worker_buffer_size(mut self, size: usize) -> Self {
        self.worker_buffer_size = size;
        self
    }

    fn resolved(mut self) -> Result<Self> {
        if self.workers == 0 {
            self.workers = 1;
        }
        if self.dict_size < crate::dict::MIN_DICT_SIZE {
            return Err(LzmaError::invalid_header(format!(
                "dictionary size must be at least {} bytes",
                crate::dict::MIN_DICT_SIZE
            )));
        }
        if self.worker_buffer_size == 0 {
            return Err(LzmaError::invalid_header(
                "worker_buffer_size must be greater than 0",
            ));
        }
        Ok(self)
    }
}

type TaskResult = std::result::Result<Vec<u8>, LzmaError>;

struct EncodeTask {
    data: Vec<u8>,
    result: SyncSender<TaskResult>,
}

enum SinkItem {
    /// A compressed blob to write once its worker delivers it.
    Blob(Receiver<TaskResult>),
    /// Acknowledge once everything submitted before this point is written.
    Flush(SyncSender<()>),
    /// Write the stream terminator and stop.
    Terminate(SyncSender<()>),
}

/// Multi-worker state of the writer.
struct MtWriter<W> {
    task_tx: Option<SyncSender<EncodeTask>>,
    task_rx: Arc<Mutex<Receiver<EncodeTask>>>,
    sink_tx: Option<SyncSender<SinkItem>>,
    err_rx: Receiver<LzmaError>,
    cancel: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
    sink: Option<JoinHandle<W>>,
    spawned: usize,
}

enum WriterMode<W> {
    Serial(Option<W>),
    Parallel(MtWriter<W>),
}

/// Streaming LZMA2 writer.
///
/// Implements [`std::io::Write`]; `write` blocks when the task and output
/// queues are full. [`Lzma2Writer::close`] (or [`Lzma2Writer::finish`])
/// must be called to flush pending data and emit the stream terminator.
pub struct Lzma2Writer<W: Write + Send + 'static> {
    cfg: Lzma2WriterConfig,
    buf: Vec<u8>,
    mode: WriterMode<W>,
    err: Option<LzmaError>,
    closed: bool,
}

impl<W: Write + Send + 'static> Lzma2Writer<W> {
    /// Create a writer over `sink`.
    pub fn new(sink: W, cfg: Lzma2WriterConfig) -> Result<Self> {
        let cfg = cfg.resolved()?;

        let mode = if cfg.workers <= 1 {
            WriterMode::Serial(Some(sink))
        } else {
            let cancel = Arc::new(AtomicBool::new(false));
            let (task_tx, task_rx) = sync_channel::<EncodeTask>(cfg.workers);
            let (sink_tx, sink_rx) = sync_channel::<SinkItem>(cfg.workers);
            let (err_tx, err_rx) = sync_channel::<LzmaError>(1);

            let sink_cancel = Arc::clone(&cancel);
            let sink_handle = thread::spawn(move || run_sink(sink, sink_rx, err_tx, sink_cancel));

            WriterMode::Parallel(MtWriter {
                task_tx: Some(task_tx),
                task_rx: Arc::new(Mutex::new(task_rx)),
                sink_tx: Some(sink_tx),
                err_rx,
                cancel,
                workers: Vec::new(),
                sink: Some(sink_handle),
                spawned: 0,
            })
        };

        Ok(Self {
            buf: Vec::with_capacity(cfg.worker_buffer_size),
            cfg,
            mode,
            err: None,
            closed: false,
        })
    }

    /// The active dictionary size.
    pub fn dict_size(&self) -> u32 {
        self.cfg.dict_size
    }

    fn check_health(&mut self) -> Result<()> {
        if let Some(err) = self.err.take() {
            // Keep a copy latched and fail with the original.
            self.err = Some(LzmaError::Io(err.as_io_error()));
            return Err(err);
        }
        if let WriterMode::Parallel(mt) = &mut self.mode {
            match mt.err_rx.try_recv() {
                Ok(err) => {
                    mt.cancel.store(true, Ordering::Relaxed);
                    self.err = Some(LzmaError::Io(err.as_io_error()));
                    return Err(err);
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => {}
            }
        }
        Ok(())
    }

    /// Hand the buffered segment to a worker (or encode it inline).
    fn submit(&mut self) -> Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let data = std::mem::replace(&mut self.buf, Vec::with_capacity(self.cfg.worker_buffer_size));

        match &mut self.mode {
            WriterMode::Serial(sink) => {
                let sink = sink.as_mut().ok_or(LzmaError::Closed)?;
                let mut out = Vec::with_capacity(data.len() / 2 + 64);
                encode_segment(&data, self.cfg.props, self.cfg.dict_size, &mut out)?;
                sink.write_all(&out)?;
            }
            WriterMode::Parallel(mt) => {
                if mt.spawned < self.cfg.workers {
                    let rx = Arc::clone(&mt.task_rx);
                    let cancel = Arc::clone(&mt.cancel);
                    let props = self.cfg.props;
                    let dict_size = self.cfg.dict_size;
                    mt.workers
                        .push(thread::spawn(move || run_encode_worker(rx, props, dict_size, cancel)));
                    mt.spawned += 1;
                }

                let (result_tx, result_rx) = sync_channel(1);
                let task_tx = mt.task_tx.as_ref().ok_or(LzmaError::Closed)?;
                let sink_tx = mt.sink_tx.as_ref().ok_or(LzmaError::Closed)?;
                if task_tx
                    .send(EncodeTask {
                        data,
                        result: result_tx,
                    })
                    .is_err()
                    || sink_tx.send(SinkItem::Blob(result_rx)).is_err()
                {
                    return Err(LzmaError::Closed);
                }
            }
        }
        Ok(())
    }

    fn flush_inner(&mut self) -> Result<()> {
        if self.closed {
            return Err(LzmaError::Closed);
        }
        self.check_health()?;
        self.submit()?;

        match &mut self.mode {
            WriterMode::Serial(sink) => {
                sink.as_mut().ok_or(LzmaError::Closed)?.flush()?;
            }
            WriterMode::Parallel(mt) => {
                let (ack_tx, ack_rx) = sync_channel(1);
                let sink_tx = mt.sink_tx.as_ref().ok_or(LzmaError::Closed)?;
                if sink_tx.send(SinkItem::Flush(ack_tx)).is_err() || ack_rx.recv().is_err() {
                    return Err(LzmaError::Closed);
                }
            }
        }
        self.check_health()
    }

    /// Flush pending data, write the `0x00` terminator and release the
    /// worker threads.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Err(LzmaError::Closed);
        }
        self.flush_inner()?;
        self.closed = true;

        match &mut self.mode {
            WriterMode::Serial(sink) => {
                let sink = sink.as_mut().ok_or(LzmaError::Closed)?;
                sink.write_all(&[0x00])?;
                sink.flush()?;
            }
            WriterMode::Parallel(mt) => {
                let (ack_tx, ack_rx) = sync_channel(1);
                if let Some(sink_tx) = mt.sink_tx.as_ref() {
                    if sink_tx.send(SinkItem::Terminate(ack_tx)).is_err() {
                        return Err(LzmaError::Closed);
                    }
                }
                let _ = ack_rx.recv();

                mt.task_tx = None;
                mt.sink_tx = None;
                for worker in mt.workers.drain(..) {
                    let _ = worker.join();
                }

                match mt.err_rx.try_recv() {
                    Ok(err) => {
                        self.err = Some(LzmaError::Io(err.as_io_error()));
                        return Err(err);
                    }
                    Err(_) => {}
                }
            }
        }
        Ok(())
    }

    /// Close the stream and return the underlying sink.
    pub fn finish(mut self) -> Result<W> {
        self.close()?;
        self.take_sink().ok_or(LzmaError::Closed)
    }

    fn take_sink(&mut self) -> Option<W> {
        match &mut self.mode {
            WriterMode::Serial(sink) => sink.take(),
            WriterMode::Parallel(mt) => mt.sink.take().and_then(|h| h.join().ok()),
        }
    }

    fn write_inner(&mut self, mut data: &[u8]) -> Result<usize> {
        if self.closed {
            return Err(LzmaError::Closed);
        }
        self.check_health()?;

        let total = data.len();
        while !data.is_empty() {
            let room = self.cfg.worker_buffer_size - self.buf.len();
            let take = room.min(data.len());
            self.buf.extend_from_slice(&data[..take]);
            data = &data[take..];
            if self.buf.len() == self.cfg.worker_buffer_size {
                self.submit()?;
            }
        }
        Ok(total)
    }
}

impl<W: Write + Send + 'static> Write for Lzma2Writer<W> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.write_inner(data).map_err(|e| self.latch(e))
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flush_inner().map_err(|e| self.latch(e))
    }
}

impl<W: Write + Send + 'static> Lzma2Writer<W> {
    fn latch(&mut self, err: LzmaError) -> io::Error {
        let io_err = err.as_io_error();
        if self.err.is_none() && !matches!(err, LzmaError::Closed) {
            self.err = Some(err);
        }
        io_err
    }
}

impl<W: Write + Send + 'static> Drop for Lzma2Writer<W> {
    fn drop(&mut self) {
        if !self.closed {
            if let WriterMode::Parallel(mt) = &mut self.mode {
                mt.cancel.store(true, Ordering::Relaxed);
                mt.task_tx = None;
                mt.sink_tx = None;
                for worker in mt.workers.drain(..) {
                    let _ = worker.join();
                }
                if let Some(sink) = mt.sink.take() {
                    let _ = sink.join();
                }
            }
        }
    }
}

fn run_sink<W: Write>(
    mut sink: W,
    sink_rx: Receiver<SinkItem>,
    err_tx: SyncSender<LzmaError>,
    cancel: Arc<AtomicBool>,
) -> W {
    let mut failed = false;

    while let Ok(item) = sink_rx.recv() {
        match item {
            SinkItem::Blob(result_rx) => {
                if failed || cancel.load(Ordering::Relaxed) {
                    continue;
                }
                let outcome = match result_rx.recv() {
                    Ok(Ok(bytes)) => sink.write_all(&bytes).map_err(LzmaError::from),
                    Ok(Err(err)) => Err(err),
                    // Worker died without delivering; cancellation follows.
                    Err(_) => Err(LzmaError::Closed),
                };
                if let Err(err) = outcome {
                    let _ = err_tx.try_send(err);
                    cancel.store(true, Ordering::Relaxed);
                    failed = true;
                }
            }
            SinkItem::Flush(ack) => {
                if !failed {
                    if let Err(err) = sink.flush() {
                        let _ = err_tx.try_send(err.into());
                        cancel.store(true, Ordering::Relaxed);
                        failed = true;
                    }
                }
                let _ = ack.send(());
            }
            SinkItem::Terminate(ack) => {
                if !failed {
                    if let Err(err) = sink.write_all(&[0x00]).and_then(|_| sink.flush()) {
                        let _ = err_tx.try_send(err.into());
                    }
                }
                let _ = ack.send(());
                break;
            }
        }
    }

    sink
}

fn run_encode_worker(
    task_rx: Arc<Mutex<Receiver<EncodeTask>>>,
    props: Properties,
    dict_size: u32,
    cancel: Arc<AtomicBool>,
) {
    loop {
        if cancel.load(Ordering::Relaxed) {
            return;
        }
        let task = {
            let Ok(guard) = task_rx.lock() else { return };
            guard.recv()
        };
        let Ok(task) = task else { return };

        let mut out = Vec::with_capacity(task.data.len() / 2 + 64);
        let result = encode_segment(&task.data, props, dict_size, &mut out).map(|_| out);
        // A dropped receiver means cancellation is underway; keep draining
        // the queue so the submitter never blocks on a full channel.
        let _ = task.result.send(result);
    }
}

/// Multi-worker state of the reader.
struct MtReader {
    out_rx: Option<Receiver<Receiver<TaskResult>>>,
    current: Option<Receiver<TaskResult>>,
    pending: Vec<u8>,
    pending_pos: usize,
    cancel: Arc<AtomicBool>,
    generator: Option<JoinHandle<()>>,
}

enum ReaderMode<R> {
    Serial(ChunkReader<R>),
    Parallel(MtReader),
}

/// Streaming LZMA2 reader.
///
/// With `workers > 1`, a generator thread splits the stream at
/// dictionary-reset boundaries and dispatches runs to decoding workers;
/// otherwise decoding happens inline on the calling thread.
pub struct Lzma2Reader<R: Read + Send + 'static> {
    mode: ReaderMode<R>,
    dict_size: u32,
    err: Option<LzmaError>,
    closed: bool,
}

impl<R: Read + Send + 'static> Lzma2Reader<R> {
    /// Create a reader over `inner`.
    pub fn new(inner: R, cfg: Lzma2ReaderConfig) -> Result<Self> {
        let cfg = cfg.resolved()?;

        let mode = if cfg.workers <= 1 {
            ReaderMode::Serial(ChunkReader::new(inner, cfg.dict_size))
        } else {
            let cancel = Arc::new(AtomicBool::new(false));
            let (out_tx, out_rx) = sync_channel(cfg.workers);
            let gen_cancel = Arc::clone(&cancel);
            let generator =
                thread::spawn(move || run_generator(inner, cfg, out_tx, gen_cancel));

            ReaderMode::Parallel(MtReader {
                out_rx: Some(out_rx),
                current: None,
                pending: Vec::new(),
                pending_pos: 0,
                cancel,
                generator: Some(generator),
            })
        };

        Ok(Self {
            mode,
            dict_size: cfg.dict_size,
            err: None,
            closed: false,
        })
    }

    /// The active dictionary size.
    pub fn dict_size(&self) -> u32 {
        self.dict_size
    }

    /// Stop all workers and release buffers. Further reads fail with
    /// `Closed`.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        match &mut self.mode {
            ReaderMode::Serial(reader) => reader.close(),
            ReaderMode::Parallel(mt) => {
                mt.cancel.store(true, Ordering::Relaxed);
                mt.current = None;
                mt.out_rx = None;
                if let Some(generator) = mt.generator.take() {
                    let _ = generator.join();
                }
            }
        }
    }

    fn read_parallel(mt: &mut MtReader, buf: &mut [u8]) -> Result<usize> {
        loop {
            if mt.pending_pos < mt.pending.len() {
                let n = (mt.pending.len() - mt.pending_pos).min(buf.len());
                buf[..n].copy_from_slice(&mt.pending[mt.pending_pos..mt.pending_pos + n]);
                mt.pending_pos += n;
                if mt.pending_pos == mt.pending.len() {
                    mt.pending.clear();
                    mt.pending_pos = 0;
                }
                return Ok(n);
            }

            if let Some(current) = &mt.current {
                match current.recv() {
                    Ok(Ok(bytes)) => {
                        mt.pending = bytes;
                        mt.pending_pos = 0;
                        continue;
                    }
                    Ok(Err(err)) => {
                        mt.cancel.store(true, Ordering::Relaxed);
                        return Err(err);
                    }
                    // Sender dropped: this task is fully delivered.
                    Err(_) => {
                        mt.current = None;
                    }
                }
                continue;
            }

            let Some(out_rx) = &mt.out_rx else {
                return Err(LzmaError::Closed);
            };
            match out_rx.recv() {
                Ok(rx) => mt.current = Some(rx),
                // Generator finished and the queue drained: end of stream.
                Err(_) => return Ok(0),
            }
        }
    }
}

impl<R: Read + Send + 'static> Read for Lzma2Reader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.closed {
            return Err(LzmaError::Closed.as_io_error());
        }
        if let Some(err) = &self.err {
            return Err(err.as_io_error());
        }
        if buf.is_empty() {
            return Ok(0);
        }

        match &mut self.mode {
            ReaderMode::Serial(reader) => reader.read(buf),
            ReaderMode::Parallel(mt) => match Self::read_parallel(mt, buf) {
                Ok(n) => Ok(n),
                Err(e) => {
                    let io_err = e.as_io_error();
                    self.err = Some(e);
                    Err(io_err)
                }
            },
        }
    }
}

impl<R: Read + Send + 'static> Drop for Lzma2Reader<R> {
    fn drop(&mut self) {
        self.close();
    }
}

struct DecodeTask {
    data: Vec<u8>,
    size: usize,
    result: SyncSender<TaskResult>,
}

/// Split the stream into decodable runs and dispatch them.
///
/// Runs alone on the generator thread, which owns the input reader. A run
/// closes when the next chunk starts a fresh segment; if a run outgrows the
/// worker buffer without hitting a boundary, the rest of the stream is
/// decoded serially right here and streamed out in slices.
fn run_generator<R: Read>(
    inner: R,
    cfg: Lzma2ReaderConfig,
    out_tx: SyncSender<Receiver<TaskResult>>,
    cancel: Arc<AtomicBool>,
) {
    let mut inner = inner;
    let (task_tx, task_rx) = sync_channel::<DecodeTask>(cfg.workers);
    let task_rx = Arc::new(Mutex::new(task_rx));
    let mut workers: Vec<JoinHandle<()>> = Vec::new();
    let mut spawned = 0usize;

    let send_error = |err: LzmaError, out_tx: &SyncSender<Receiver<TaskResult>>| {
        let (tx, rx) = sync_channel(1);
        let _ = tx.send(Err(err));
        let _ = out_tx.send(rx);
    };

    let mut pending: Option<(ChunkHeader, Vec<u8>)> = None;
    let mut saw_eos = false;
    let mut fallback: Option<Vec<u8>> = None;

    while !saw_eos && fallback.is_none() && !cancel.load(Ordering::Relaxed) {
        let mut run_buf: Vec<u8> = Vec::with_capacity(cfg.worker_buffer_size / 4);
        let mut run_size = 0usize;

        loop {
            let (header, raw) = match pending.take() {
                Some(entry) => entry,
                None => {
                    let mut raw = Vec::with_capacity(8);
                    match ChunkHeader::read_from(&mut inner, &mut raw) {
                        Ok(Some(header)) => (header, raw),
                        Ok(None) => {
                            send_error(
                                LzmaError::unexpected_eof(
                                    "stream ended without the 0x00 terminator",
                                ),
                                &out_tx,
                            );
                            drop(task_tx);
                            join_all(workers);
                            return;
                        }
                        Err(err) => {
                            send_error(err, &out_tx);
                            drop(task_tx);
                            join_all(workers);
                            return;
                        }
                    }
                }
            };

            if header == ChunkHeader::EndOfStream {
                saw_eos = true;
                break;
            }
            if header.starts_segment() && run_size > 0 {
                pending = Some((header, raw));
                break;
            }

            run_buf.extend_from_slice(&raw);
            let payload = header.payload_size();
            let start = run_buf.len();
            run_buf.resize(start + payload, 0);
            match inner.read_exact(&mut run_buf[start..]) {
                Ok(()) => {}
                Err(e) => {
                    let err = if e.kind() == io::ErrorKind::UnexpectedEof {
                        LzmaError::unexpected_eof("truncated chunk payload")
                    } else {
                        e.into()
                    };
                    send_error(err, &out_tx);
                    drop(task_tx);
                    join_all(workers);
                    return;
                }
            }
            run_size += header.unpacked_size();

            if run_size > cfg.worker_buffer_size {
                // No reset boundary inside the buffer: decode the rest of
                // the stream serially in the foreground.
                fallback = Some(run_buf);
                run_size = 0;
                run_buf = Vec::new();
                break;
            }
        }

        if run_size > 0 {
            if spawned < cfg.workers {
                let rx = Arc::clone(&task_rx);
                let dict_size = cfg.dict_size;
                let worker_cancel = Arc::clone(&cancel);
                workers.push(thread::spawn(move || {
                    run_decode_worker(rx, dict_size, worker_cancel)
                }));
                spawned += 1;
            }

            let (result_tx, result_rx) = sync_channel(1);
            let task = DecodeTask {
                data: run_buf,
                size: run_size,
                result: result_tx,
            };
            if task_tx.send(task).is_err() || out_tx.send(result_rx).is_err() {
                break;
            }
        }
    }

    if let Some(prefix) = fallback {
        let (result_tx, result_rx) = sync_channel::<TaskResult>(2);
        if out_tx.send(result_rx).is_ok() {
            let mut reader = ChunkReader::new(Cursor::new(prefix).chain(inner), cfg.dict_size);
            let mut slice = vec![0u8; 64 << 10];
            loop {
                if cancel.load(Ordering::Relaxed) {
                    break;
                }
                match reader.read(&mut slice) {
                    Ok(0) => break,
                    Ok(n) => {
                        if result_tx.send(Ok(slice[..n].to_vec())).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        let _ = result_tx.send(Err(e.into()));
                        break;
                    }
                }
            }
        }
    }

    drop(task_tx);
    join_all(workers);
}

fn join_all(workers: Vec<JoinHandle<()>>) {
    for worker in workers {
        let _ = worker.join();
    }
}

fn run_decode_worker(
    task_rx: Arc<Mutex<Receiver<DecodeTask>>>,
    dict_size: u32,
    cancel: Arc<AtomicBool>,
) {
    loop {
        if cancel.load(Ordering::Relaxed) {
            return;
        }
        let task = {
            let Ok(guard) = task_rx.lock() else { return };
            guard.recv()
        };
        let Ok(task) = task else { return };

        let mut reader =
            ChunkReader::new(Cursor::new(task.data), dict_size).without_eos_requirement();
        let mut out = Vec::with_capacity(task.size);
        let result = match reader.read_to_end(&mut out) {
            Ok(_) => {
                if out.len() == task.size {
                    Ok(out)
                } else {
                    Err(LzmaError::ChunkSizeMismatch {
                        declared: task.size as u64,
                        actual: out.len() as u64,
                    })
                }
            }
            Err(e) => Err(e.into()),
        };

        // Keep draining on a dropped receiver so the generator never blocks
        // on a full task queue during cancellation.
        let _ = task.result.send(result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compress(data: &[u8], cfg: Lzma2WriterConfig) -> Vec<u8> {
        let mut writer = Lzma2Writer::new(Vec::new(), cfg).unwrap();
        writer.write_all(data).unwrap();
        writer.finish().unwrap()
    }

    fn decompress(stream: &[u8], cfg: Lzma2ReaderConfig) -> io::Result<Vec<u8>> {
        let mut reader =
            Lzma2Reader::new(Cursor::new(stream.to_vec()), cfg).map_err(io::Error::from)?;
        let mut out = Vec::new();
        reader.read_to_end(&mut out)?;
        Ok(out)
    }

    fn pattern(len: usize) -> Vec<u8> {
        let block: Vec<u8> = (0u8..64).collect();
        let mut data = Vec::with_capacity(len);
        while data.len() < len {
            let take = block.len().min(len - data.len());
            data.extend_from_slice(&block[..take]);
        }
        data
    }

    #[test]
    fn test_roundtrip_serial() {
        let data = pattern(300_000);
        let cfg = Lzma2WriterConfig::default().workers(1);
        let stream = compress(&data, cfg);
        assert_eq!(*stream.last().unwrap(), 0x00);

        let decoded = decompress(&stream, Lzma2ReaderConfig::default()).unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn test_roundtrip_parallel_writer() {
        let data = pattern(900_000);
        let cfg = Lzma2WriterConfig::default()
            .workers(4)
            .worker_buffer_size(128 << 10);
        let stream = compress(&data, cfg);

        let decoded = decompress(&stream, Lzma2ReaderConfig::default()).unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn test_roundtrip_parallel_reader() {
        let data = pattern(900_000);
        let wcfg = Lzma2WriterConfig::default()
            .workers(4)
            .worker_buffer_size(128 << 10);
        let stream = compress(&data, wcfg);

        let rcfg = Lzma2ReaderConfig::default()
            .workers(4)
            .worker_buffer_size(128 << 10);
        let decoded = decompress(&stream, rcfg).unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn test_determinism_across_worker_counts() {
        let data = pattern(700_000);
        let base = Lzma2WriterConfig::default().worker_buffer_size(128 << 10);

        let one = compress(&data, base.workers(1));
        let two = compress(&data, base.workers(2));
        let four = compress(&data, base.workers(4));
        assert_eq!(one, two);
        assert_eq!(one, four);
    }

    #[test]
    fn test_empty_stream() {
        let stream = compress(b"", Lzma2WriterConfig::default().workers(2));
        assert_eq!(stream, vec![0x00]);
        let decoded = decompress(&stream, Lzma2ReaderConfig::default().workers(2)).unwrap();
        assert!(decoded.is_empty());
    }

    #[test]
    fn test_flush_completes_chunks() {
        let mut writer = Lzma2Writer::new(Vec::new(), Lzma2WriterConfig::default().workers(2))
            .unwrap();
        writer.write_all(b"flush me through the pipeline").unwrap();
        writer.flush().unwrap();
        let stream = writer.finish().unwrap();
        let decoded = decompress(&stream, Lzma2ReaderConfig::default()).unwrap();
        assert_eq!(decoded, b"flush me through the pipeline");
    }

    #[test]
    fn test_closed_writer() {
        let mut writer =
            Lzma2Writer::new(Vec::new(), Lzma2WriterConfig::default().workers(1)).unwrap();
        writer.close().unwrap();
        let err = writer.write(b"late").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        assert!(matches!(writer.close(), Err(LzmaError::Closed)));
    }

    #[test]
    fn test_closed_reader() {
        let stream = compress(b"abc", Lzma2WriterConfig::default().workers(1));
        let mut reader =
            Lzma2Reader::new(Cursor::new(stream), Lzma2ReaderConfig::default()).unwrap();
        reader.close();
        let mut out = Vec::new();
        let err = reader.read_to_end(&mut out).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[test]
    fn test_parallel_reader_serial_fallback() {
        // A single huge segment has no internal reset boundaries, so the
        // parallel reader must fall back to serial decoding.
        let data = pattern(2 << 20);
        let stream = compress(
            &data,
            Lzma2WriterConfig::default().workers(1).worker_buffer_size(4 << 20),
        );

        let rcfg = Lzma2ReaderConfig::default()
            .workers(4)
            .worker_buffer_size(256 << 10);
        let decoded = decompress(&stream, rcfg).unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn test_truncated_parallel_read() {
        let data = pattern(600_000);
        let stream = compress(
            &data,
            Lzma2WriterConfig::default().workers(2).worker_buffer_size(128 << 10),
        );
        let truncated = &stream[..stream.len() - 2];
        let rcfg = Lzma2ReaderConfig::default()
            .workers(2)
            .worker_buffer_size(128 << 10);
        let err = decompress(truncated, rcfg).unwrap_err();
        assert!(
            err.kind() == io::ErrorKind::UnexpectedEof
                || err.kind() == io::ErrorKind::InvalidData
        );
    }

    #[test]
    fn test_invalid_config() {
        assert!(Lzma2Writer::new(Vec::new(), Lzma2WriterConfig::default().dict_size(16)).is_err());
        assert!(
            Lzma2Reader::new(Cursor::new(vec![0u8]), Lzma2ReaderConfig::default().dict_size(16))
                .is_err()
        );
        let zero_buf = Lzma2WriterConfig::default().worker_buffer_size(0);
        assert!(Lzma2Writer::new(Vec::new(), zero_buf).is_err());
    }
}
