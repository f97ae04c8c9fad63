//! Spawning of the pipeline's background tasks.
//!
//! Batch workers, reconnect loops and sync daemons run on the ambient Tokio
//! runtime when there is one. Without a runtime, the task gets a dedicated
//! thread driving a current-thread runtime, so the pipeline also works from
//! plain synchronous programs.
use crate::tps_error;
use std::future::Future;
use tokio::runtime::Handle;
use tokio::sync::oneshot;

/// Completion handle of a background task.
#[derive(Debug)]
pub(crate) struct BackgroundTask {
    done: oneshot::Receiver<()>,
}

impl BackgroundTask {
    /// Resolves once the task returned. Errors if the task panicked or never ran.
    pub(crate) async fn join(self) -> Result<(), String> {
        self.done
            .await
            .map_err(|_| "background task exited without completing".to_string())
    }
}

pub(crate) fn spawn<F>(name: &'static str, future: F) -> BackgroundTask
where
    F: Future<Output = ()> + Send + 'static,
{
    let (done_tx, done) = oneshot::channel();
    let task = async move {
        future.await;
        let _ = done_tx.send(());
    };

    match Handle::try_current() {
        Ok(handle) => {
            drop(handle.spawn(task));
        }
        Err(_) => {
            let spawned = std::thread::Builder::new()
                .name(name.to_string())
                .spawn(move || {
                    match tokio::runtime::Builder::new_current_thread()
                        .enable_all()
                        .build()
                    {
                        Ok(rt) => rt.block_on(task),
                        Err(err) => {
                            tps_error!(name: "Runtime.BuildFailed", task = name, error = format!("{err}"));
                        }
                    }
                });
            if let Err(err) = spawned {
                tps_error!(name: "Runtime.ThreadSpawnFailed", task = name, error = format!("{err}"));
            }
        }
    }

    BackgroundTask { done }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn runs_on_ambient_runtime() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        let task = spawn("test", async move { flag.store(true, Ordering::SeqCst) });
        task.join().await.unwrap();
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn runs_on_dedicated_thread_without_runtime() {
        let (tx, rx) = std::sync::mpsc::channel();
        let _task = spawn("test-thread", async move {
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
            let _ = tx.send(std::thread::current().name().map(str::to_string));
        });
        let name = rx.recv_timeout(std::time::Duration::from_secs(5)).unwrap();
        assert_eq!(name.as_deref(), Some("test-thread"));
    }
}
