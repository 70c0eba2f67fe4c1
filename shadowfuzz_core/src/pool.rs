//! Bounded worker pool. Workers pull `(index, task)` pairs from a shared
//! queue and send `(index, result)` pairs back; results are returned in task
//! order regardless of completion order.

use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;

pub fn default_workers() -> usize {
    thread::available_parallelism().map_or(1, |n| n.get())
}

pub fn run_pool<T, R, F>(tasks: Vec<T>, workers: usize, work: F) -> Vec<R>
where
    T: Send,
    R: Send,
    F: Fn(T) -> R + Sync,
{
    let total = tasks.len();
    if total == 0 {
        return Vec::new();
    }
    let workers = workers.clamp(1, total);

    let (task_tx, task_rx) = mpsc::channel::<(usize, T)>();
    for pair in tasks.into_iter().enumerate() {
        // The receiver is alive until the scope below ends.
        let _ = task_tx.send(pair);
    }
    drop(task_tx);
    let task_rx = Arc::new(Mutex::new(task_rx));
    let (result_tx, result_rx) = mpsc::channel::<(usize, R)>();

    thread::scope(|scope| {
        for _ in 0..workers {
            let task_rx = Arc::clone(&task_rx);
            let result_tx = result_tx.clone();
            let work = &work;
            scope.spawn(move || {
                loop {
                    let next = match task_rx.lock() {
                        Ok(rx) => rx.recv(),
                        Err(_) => break,
                    };
                    let Ok((index, task)) = next else {
                        break;
                    };
                    if result_tx.send((index, work(task))).is_err() {
                        break;
                    }
                }
            });
        }
    });
    drop(result_tx);

    let mut results: Vec<(usize, R)> = result_rx.into_iter().collect();
    results.sort_by_key(|(index, _)| *index);
    results.into_iter().map(|(_, result)| result).collect()
}
