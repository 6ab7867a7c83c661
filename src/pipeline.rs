//! Parallel block compression.
//!
//! A ring of `T` cells connects three roles: the producer (the thread
//! assembling blocks) claims an empty cell and fills it, one worker per
//! cell compresses, and a single writer drains cells in cyclic order and
//! appends to the archive. The producer receives cell indices from the
//! `empty` channel in the order the writer releases them (the channel
//! starts seeded `0..T`), so blocks reach the archive in exactly
//! the order they were submitted, with no reordering buffer.
//!
//! Each cell has a capacity-1 `full` channel (producer → its worker) and
//! a capacity-1 `compressed` channel (worker → writer); `empty` is a
//! capacity-`T` channel of cell indices. Shutdown pushes one sentinel per
//! cell; every worker forwards exactly one and exits, and the writer
//! exits on the sentinel that reaches the front of the ring.

use std::io::Write;
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Receiver, Sender};

use crate::error::{Error, Result};
use crate::method;

/// One block ready for compression.
pub struct BlockJob {
    /// Raw fragment bytes, already padded with the redundant trailer.
    pub data: Vec<u8>,
    /// Segment filename (journal naming).
    pub filename: String,
    /// Method string (digit or explicit recipe).
    pub method: String,
    /// Block classification driving recipe expansion.
    pub type_tag: u32,
}

enum CellInput {
    Work(BlockJob),
    Shutdown,
}

enum CellOutput {
    Done(Vec<u8>),
    Failed(Error),
    Shutdown,
}

/// Handle owned by the producing thread.
pub struct CompressPipeline {
    empty_rx: Receiver<usize>,
    full_tx: Vec<Sender<CellInput>>,
    workers: Vec<JoinHandle<()>>,
    writer: JoinHandle<(Box<dyn Write + Send>, Vec<u32>, Option<Error>)>,
}

impl CompressPipeline {
    /// Launches `threads` workers and the writer over `sink`.
    pub fn new(threads: usize, sink: Box<dyn Write + Send>, fragile: bool) -> CompressPipeline {
        let threads = threads.max(1);
        let (empty_tx, empty_rx) = bounded::<usize>(threads);
        let mut full_tx = Vec::with_capacity(threads);
        let mut out_rx = Vec::with_capacity(threads);
        let mut workers = Vec::with_capacity(threads);
        for cell in 0..threads {
            empty_tx.send(cell).expect("seeding empty ring");
            let (ftx, frx) = bounded::<CellInput>(1);
            let (ctx, crx) = bounded::<CellOutput>(1);
            full_tx.push(ftx);
            out_rx.push(crx);
            workers.push(
                std::thread::Builder::new()
                    .name(format!("compress-{cell}"))
                    .spawn(move || worker(cell, frx, ctx, fragile))
                    .expect("spawn compression worker"),
            );
        }
        let writer = std::thread::Builder::new()
            .name("archive-writer".into())
            .spawn(move || write_loop(sink, out_rx, empty_tx))
            .expect("spawn writer");
        CompressPipeline {
            empty_rx,
            full_tx,
            workers,
            writer,
        }
    }

    /// Hands one block to the ring; blocks while all cells are busy.
    pub fn submit(&self, job: BlockJob) {
        let cell = self.empty_rx.recv().expect("ring alive");
        self.full_tx[cell]
            .send(CellInput::Work(job))
            .expect("worker alive");
    }

    /// Shuts the ring down and returns the sink plus the compressed size
    /// of every submitted block, in submission order.
    pub fn finish(self) -> Result<(Box<dyn Write + Send>, Vec<u32>)> {
        for _ in 0..self.full_tx.len() {
            let cell = self.empty_rx.recv().expect("ring alive");
            self.full_tx[cell]
                .send(CellInput::Shutdown)
                .expect("worker alive");
        }
        for w in self.workers {
            w.join().expect("compression worker panicked");
        }
        let (sink, csizes, error) = self.writer.join().expect("writer panicked");
        match error {
            Some(e) => Err(e),
            None => Ok((sink, csizes)),
        }
    }
}

fn worker(cell: usize, input: Receiver<CellInput>, output: Sender<CellOutput>, fragile: bool) {
    while let Ok(msg) = input.recv() {
        match msg {
            CellInput::Shutdown => {
                let _ = output.send(CellOutput::Shutdown);
                return;
            }
            CellInput::Work(job) => {
                let insize = job.data.len();
                let mut out = Vec::new();
                let result = method::compress_block(
                    &mut out,
                    job.data,
                    &job.method,
                    &job.filename,
                    None,
                    job.type_tag,
                    fragile,
                );
                let msg = match result {
                    Ok(used) => {
                        log::debug!(
                            "job {cell}: {insize} -> {} bytes, method {used}",
                            out.len()
                        );
                        CellOutput::Done(out)
                    }
                    Err(e) => CellOutput::Failed(e),
                };
                if output.send(msg).is_err() {
                    return;
                }
            }
        }
    }
}

fn write_loop(
    mut sink: Box<dyn Write + Send>,
    out_rx: Vec<Receiver<CellOutput>>,
    empty_tx: Sender<usize>,
) -> (Box<dyn Write + Send>, Vec<u32>, Option<Error>) {
    let mut csizes = Vec::new();
    let mut error: Option<Error> = None;
    let mut front = 0usize;
    loop {
        match out_rx[front].recv() {
            Ok(CellOutput::Shutdown) | Err(_) => break,
            Ok(CellOutput::Done(data)) => {
                if error.is_none() {
                    csizes.push(data.len() as u32);
                    if let Err(e) = sink.write_all(&data) {
                        error = Some(e.into());
                    }
                }
                let _ = empty_tx.send(front);
            }
            Ok(CellOutput::Failed(e)) => {
                if error.is_none() {
                    error = Some(e);
                }
                let _ = empty_tx.send(front);
            }
        }
        front = (front + 1) % out_rx.len();
    }
    (sink, csizes, error)
}
