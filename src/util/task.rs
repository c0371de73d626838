use std::ops::{Deref, DerefMut};

use tokio::task::JoinHandle;

/// A `JoinHandle` that aborts its task when dropped, so a supervisor
/// that stops tracking a spawned task (a client disconnects, the
/// owning record is removed, the router itself is torn down) doesn't
/// leak it running in the background.
pub struct JoinHandleGuard<T>(JoinHandle<T>);

pub trait WithJoinHandleGuard {
    type Output;
    fn guard(self) -> JoinHandleGuard<Self::Output>;
}

impl<T> WithJoinHandleGuard for JoinHandle<T> {
    type Output = T;
    fn guard(self) -> JoinHandleGuard<Self::Output> {
        JoinHandleGuard(self)
    }
}

impl<T> Deref for JoinHandleGuard<T> {
    type Target = JoinHandle<T>;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<T> DerefMut for JoinHandleGuard<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl<T> Drop for JoinHandleGuard<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn dropping_the_guard_aborts_the_task() {
        let handle = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        })
        .guard();
        drop(handle);
        tokio::task::yield_now().await;
    }
}
