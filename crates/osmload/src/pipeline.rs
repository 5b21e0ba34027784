//! Fixed-size pools of named worker threads.
//!
//! A stage hands each pool the receiving ends it reads from and clones of the
//! senders it writes to. The coordinator keeps the original senders and drops
//! them only after [`WorkerPool::join`] returns, so a downstream channel closes
//! exactly when its last producer has stopped.

use std::sync::Arc;
use std::thread::{self, Scope, ScopedJoinHandle};

use anyhow::{anyhow, Context, Result};

pub struct WorkerPool<'scope> {
    name: String,
    handles: Vec<ScopedJoinHandle<'scope, Result<()>>>,
}

impl<'scope> WorkerPool<'scope> {
    /// Starts `workers` threads named `{name}-{i}`, each running `work(i)`.
    ///
    /// The closure is shared, so anything it captures (typically a
    /// `Receiver` and a `Sender`) is dropped once the last worker exits.
    pub fn spawn<'env, F>(
        scope: &'scope Scope<'scope, 'env>,
        name: &str,
        workers: usize,
        work: F,
    ) -> Result<Self>
    where
        F: Fn(usize) -> Result<()> + Send + Sync + 'scope,
    {
        let work = Arc::new(work);
        let workers = workers.max(1);
        let mut handles = Vec::with_capacity(workers);
        for i in 0..workers {
            let work = Arc::clone(&work);
            let handle = thread::Builder::new()
                .name(format!("{name}-{i}"))
                .spawn_scoped(scope, move || work(i))
                .with_context(|| format!("spawning {name} worker {i}"))?;
            handles.push(handle);
        }
        log::debug!("started {workers} {name} workers");
        Ok(Self {
            name: name.to_owned(),
            handles,
        })
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Waits for every worker and returns the first failure, if any.
    /// A panicking worker counts as a failure.
    pub fn join(self) -> Result<()> {
        let mut first = None;
        for (i, handle) in self.handles.into_iter().enumerate() {
            let outcome = handle
                .join()
                .unwrap_or_else(|_| Err(anyhow!("{} worker {} panicked", self.name, i)));
            if let Err(err) = outcome {
                match first {
                    None => first = Some(err),
                    Some(_) => log::debug!("{} worker {} also failed: {:#}", self.name, i, err),
                }
            }
        }
        match first {
            Some(err) => Err(err.context(format!("{} stage failed", self.name))),
            None => Ok(()),
        }
    }
}
