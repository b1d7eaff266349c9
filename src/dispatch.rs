// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Runs completion handlers on a thread owned by the control plane.
//!
//! The device invokes host callbacks on its own thread. Each callback built by
//! [`DispatchHandle::host_callback`] only forwards the real handler to the dispatcher thread and
//! waits for it to finish, so the device queue still advances in order while every handler runs
//! on one known thread.

use std::sync::mpsc;
use std::thread;
use std::thread::JoinHandle;

use base::debug;
use base::error;

use crate::device::HostCallback;
use crate::error::Error;
use crate::error::Result;

type Job = Box<dyn FnOnce() + Send + 'static>;

enum Message {
    Run { job: Job, done: mpsc::Sender<()> },
    Exit,
}

/// Owner of the dispatcher thread. Dropping it stops and joins the thread.
pub struct CompletionDispatcher {
    sender: mpsc::Sender<Message>,
    worker: Option<JoinHandle<()>>,
}

impl CompletionDispatcher {
    /// Starts a dispatcher thread named `<name>_completion`.
    pub fn start(name: &str) -> Result<CompletionDispatcher> {
        let (sender, receiver) = mpsc::channel();
        let worker = thread::Builder::new()
            .name(format!("{}_completion", name))
            .spawn(move || run(receiver))
            .map_err(|e| Error::SpawnThread("completion dispatcher", e))?;
        Ok(CompletionDispatcher {
            sender,
            worker: Some(worker),
        })
    }

    pub fn handle(&self) -> DispatchHandle {
        DispatchHandle {
            sender: self.sender.clone(),
        }
    }
}

impl Drop for CompletionDispatcher {
    fn drop(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        let _ = self.sender.send(Message::Exit);
        if worker.thread().id() == thread::current().id() {
            // Dropped by one of its own jobs; the loop exits once that job returns.
            return;
        }
        if worker.join().is_err() {
            error!("completion dispatcher thread panicked");
        }
    }
}

fn run(receiver: mpsc::Receiver<Message>) {
    while let Ok(message) = receiver.recv() {
        match message {
            Message::Run { job, done } => {
                job();
                let _ = done.send(());
            }
            Message::Exit => break,
        }
    }
    debug!("completion dispatcher exiting");
}

/// Cheap handle for posting work to a dispatcher.
#[derive(Clone)]
pub struct DispatchHandle {
    sender: mpsc::Sender<Message>,
}

impl DispatchHandle {
    /// Wraps `job` into a device host callback that runs `job` on the dispatcher thread and only
    /// returns once it has finished.
    ///
    /// If the dispatcher is gone the job is dropped without running.
    pub fn host_callback(&self, job: impl FnOnce() + Send + 'static) -> HostCallback {
        let sender = self.sender.clone();
        Box::new(move || {
            let (done, finished) = mpsc::channel();
            let message = Message::Run {
                job: Box::new(job),
                done,
            };
            if sender.send(message).is_err() {
                error!("completion dispatcher stopped, dropping completion");
                return;
            }
            // Fails only if the job was dropped unrun, which is fine to ignore here.
            let _ = finished.recv();
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    use super::*;

    #[test]
    fn job_runs_on_dispatcher_thread_before_callback_returns() {
        let dispatcher = CompletionDispatcher::start("test").unwrap();
        let (tx, rx) = mpsc::channel();
        let callback = dispatcher.handle().host_callback(move || {
            tx.send(thread::current().name().map(str::to_string)).unwrap();
        });
        thread::spawn(callback).join().unwrap();
        assert_eq!(rx.try_recv().unwrap().as_deref(), Some("test_completion"));
    }

    #[test]
    fn jobs_run_in_post_order() {
        let dispatcher = CompletionDispatcher::start("order").unwrap();
        let handle = dispatcher.handle();
        let seen = Arc::new(sync::Mutex::new(Vec::new()));
        for i in 0..5 {
            let seen = seen.clone();
            (handle.host_callback(move || seen.lock().push(i)))();
        }
        assert_eq!(*seen.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn callback_after_stop_does_not_run() {
        let dispatcher = CompletionDispatcher::start("stopped").unwrap();
        let handle = dispatcher.handle();
        drop(dispatcher);
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = ran.clone();
        (handle.host_callback(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }))();
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }
}
