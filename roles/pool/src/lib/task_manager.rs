//! Tracks spawned tasks so shutdown can join or abort them as a group.

use std::sync::Mutex;

use tokio::task::JoinHandle;

#[derive(Default)]
pub struct TaskManager {
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawn<F>(&self, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(future);
        if let Ok(mut handles) = self.handles.lock() {
            handles.push(handle);
        }
    }

    /// Await every tracked task.
    pub async fn join_all(&self) {
        let handles = match self.handles.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(_) => Vec::new(),
        };
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Abort every tracked task without waiting.
    pub async fn abort_all(&self) {
        if let Ok(guard) = self.handles.lock() {
            for handle in guard.iter() {
                handle.abort();
            }
        }
    }
}
