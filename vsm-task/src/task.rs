// Copyright (c) 2024-2025 Viable Systems (viablesystems.io)
// This file is part of the VSM repository.

// You should have received a copy of the MIT License
// along with the VSM repository. If not, see <https://mit-license.org/>.

//! A named task handle that aborts its task on drop, so owning structs can
//! hold background loops without leak-on-drop footguns.

use std::future::Future;

use tokio::task::JoinHandle;

#[derive(Debug)]
pub struct TaskHandle {
    name: String,
    handle: Option<JoinHandle<()>>,
}

impl TaskHandle {
    /// Spawn a future under a name. The task is aborted when the handle is
    /// dropped.
    pub fn spawn(name: impl Into<String>, fut: impl Future<Output = ()> + Send + 'static) -> Self {
        Self {
            name: name.into(),
            handle: Some(tokio::spawn(fut)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Abort now instead of at drop.
    pub fn abort(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod test {
    use std::{
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
        time::Duration,
    };

    use super::*;

    #[tokio::test]
    async fn test_drop_aborts_the_task() {
        let finished = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&finished);
        let handle = TaskHandle::spawn("sleeper", async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            flag.store(true, Ordering::SeqCst);
        });
        assert!(!handle.is_finished());
        drop(handle);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!finished.load(Ordering::SeqCst));
    }
}
