//! Producer/consumer batch frame
//!
//! One producer reads text lines and accumulates batches of up to
//! [`BATCH_SIZE`] lines; `workers` consumer threads drain a bounded channel
//! (capacity 2) and hand each batch to the task's `run_batch`. The producer
//! closes the channel at EOF; consumers exit when it drains. Input read
//! errors are logged and end the stream — they never cancel in-flight
//! batches.
//!
//! The channel capacity of 2 keeps at most three batches alive (one being
//! filled, two queued), which bounds memory while letting the producer run
//! ahead of slow consumers.

#![forbid(unsafe_code)]

use std::io::BufRead;
use std::thread;

use tracing::{info, warn};

/// Lines per dispatched batch.
pub const BATCH_SIZE: usize = 5000;

/// Producer progress log interval, in lines.
const LOG_EVERY: u64 = 200_000;

/// A batch consumer: the trainer and the predictor both implement this.
///
/// `run_batch` processes the slice in order and returns when done. It must
/// tolerate concurrent invocations from multiple workers.
pub trait BatchTask: Sync {
    fn run_batch(&self, lines: &[String]);
}

/// Run `task` over every line of `reader` with `workers` consumer threads.
///
/// Returns after the input is exhausted and every dispatched batch has been
/// processed.
pub fn run<T: BatchTask, R: BufRead>(task: &T, mut reader: R, workers: usize) {
    let workers = workers.max(1);
    let (tx, rx) = crossbeam_channel::bounded::<Vec<String>>(2);

    thread::scope(|scope| {
        for _ in 0..workers {
            let rx = rx.clone();
            scope.spawn(move || {
                for batch in rx.iter() {
                    task.run_batch(&batch);
                }
            });
        }
        drop(rx);

        let mut total: u64 = 0;
        let mut batch: Vec<String> = Vec::with_capacity(BATCH_SIZE);
        let mut buf = String::new();
        loop {
            buf.clear();
            match reader.read_line(&mut buf) {
                Ok(0) => break,
                Ok(_) => {
                    batch.push(buf.trim_end_matches(['\n', '\r']).to_string());
                    total += 1;
                    if total % LOG_EVERY == 0 {
                        info!("{total} lines dispatched");
                    }
                    if batch.len() >= BATCH_SIZE {
                        let full = std::mem::replace(&mut batch, Vec::with_capacity(BATCH_SIZE));
                        if tx.send(full).is_err() {
                            break;
                        }
                    }
                }
                Err(e) => {
                    warn!("error reading input: {e}");
                    break;
                }
            }
        }
        if !batch.is_empty() {
            let _ = tx.send(batch);
        }
        drop(tx);
    });
}
