//! A simple adaptive threadpool that executes deferred work and IO
//! completions off the caller's thread.

use std::sync::atomic::{AtomicUsize, Ordering::SeqCst};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use log::warn;

use crate::OneShot;

const MAX_THREADS: usize = 128;

type Task = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug)]
struct Shared {
    sender: Sender<Task>,
    receiver: Receiver<Task>,
    standby_threads: AtomicUsize,
    total_threads: AtomicUsize,
    name: String,
}

/// An adaptive pool of worker threads. Workers are spawned on demand up
/// to `MAX_THREADS` and terminate themselves if they receive no work for
/// one second. Each storage component holds this by `Arc` handle; there
/// is no process-wide pool.
#[derive(Debug, Clone)]
pub struct ThreadPool {
    shared: Arc<Shared>,
}

impl ThreadPool {
    pub fn new(name: &str) -> ThreadPool {
        let (sender, receiver) = unbounded();
        let pool = ThreadPool {
            shared: Arc::new(Shared {
                sender,
                receiver,
                standby_threads: AtomicUsize::new(0),
                total_threads: AtomicUsize::new(0),
                name: name.to_owned(),
            }),
        };
        maybe_spawn_new_thread(&pool.shared);
        pool
    }

    /// Spawn a function on the threadpool.
    pub fn spawn<F, R>(&self, work: F) -> OneShot<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let (promise_filler, promise) = OneShot::pair();
        let task = move || {
            let result = (work)();
            promise_filler.fill(result);
        };

        if self.shared.sender.send(Box::new(task)).is_err() {
            // receiver half lives in Shared alongside the sender,
            // so a send can only fail after the pool is torn down
            warn!("threadpool {} used after teardown", self.shared.name);
            return promise;
        }

        maybe_spawn_new_thread(&self.shared);

        promise
    }
}

fn perform_work(shared: &Arc<Shared>) {
    let wait_limit = Duration::from_secs(1);

    loop {
        shared.standby_threads.fetch_add(1, SeqCst);

        let task_res = shared.receiver.recv_timeout(wait_limit);

        if shared.standby_threads.fetch_sub(1, SeqCst) < 2 {
            maybe_spawn_new_thread(shared);
        }

        match task_res {
            Ok(task) => (task)(),
            Err(RecvTimeoutError::Disconnected) => return,
            Err(RecvTimeoutError::Timeout) => {}
        }

        while let Ok(task) = shared.receiver.try_recv() {
            (task)();
        }

        if !cfg!(feature = "for-internal-testing-only")
            && shared.standby_threads.load(SeqCst) > 2
        {
            return;
        }
    }
}

// Create up to MAX_THREADS dynamic worker threads. Dynamic threads
// terminate themselves if they don't receive any work after one second.
fn maybe_spawn_new_thread(shared: &Arc<Shared>) {
    let total_workers = shared.total_threads.load(SeqCst);
    let standby_workers = shared.standby_threads.load(SeqCst);
    if standby_workers >= 1 || total_workers >= MAX_THREADS {
        return;
    }

    let worker_shared = shared.clone();
    let spawn_res = thread::Builder::new()
        .name(format!("{}-io-worker", shared.name))
        .spawn(move || {
            worker_shared.total_threads.fetch_add(1, SeqCst);
            perform_work(&worker_shared);
            worker_shared.total_threads.fetch_sub(1, SeqCst);
        });

    if let Err(e) = spawn_res {
        warn!(
            "Failed to dynamically increase the threadpool size: {:?}. \
             Currently have {} running IO threads",
            e, total_workers
        );
    }
}
