use crate::types::SnapshotId;
use anyhow::{anyhow, Result};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;

/// Resolves once every tasklet of this member has flushed its part of a snapshot.
///
/// Single-resolution: each snapshot gets a fresh handle. Await it, poll it with
/// [`SnapshotCompletion::try_result`], or block on it with [`SnapshotCompletion::wait`].
#[derive(Debug)]
pub struct SnapshotCompletion {
    snapshot_id: SnapshotId,
    receiver: oneshot::Receiver<SnapshotId>,
}

impl SnapshotCompletion {
    /// A fresh, unresolved handle and the sender that resolves it.
    pub(crate) fn channel(snapshot_id: SnapshotId) -> (oneshot::Sender<SnapshotId>, Self) {
        let (sender, receiver) = oneshot::channel();
        (
            sender,
            Self {
                snapshot_id,
                receiver,
            },
        )
    }

    /// A handle that is already resolved.
    pub(crate) fn resolved(snapshot_id: SnapshotId) -> Self {
        let (sender, completion) = Self::channel(snapshot_id);
        // The receiver is alive, so the send cannot fail.
        let _ = sender.send(snapshot_id);
        completion
    }

    pub fn snapshot_id(&self) -> SnapshotId {
        self.snapshot_id
    }

    /// Non-blocking check: `None` while the snapshot is still running.
    pub fn try_result(&mut self) -> Option<Result<SnapshotId>> {
        match self.receiver.try_recv() {
            Ok(id) => Some(Ok(id)),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(self.abandoned())),
        }
    }

    /// Block the current thread until the snapshot completes.
    ///
    /// Must not be called from within an async runtime; await the handle there.
    pub fn wait(self) -> Result<SnapshotId> {
        let snapshot_id = self.snapshot_id;
        self.receiver
            .blocking_recv()
            .map_err(|_| anyhow!("snapshot {} was abandoned before completion", snapshot_id))
    }

    fn abandoned(&self) -> anyhow::Error {
        anyhow!(
            "snapshot {} was abandoned before completion",
            self.snapshot_id
        )
    }
}

impl Future for SnapshotCompletion {
    type Output = Result<SnapshotId>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Ready(Ok(id)) => Poll::Ready(Ok(id)),
            Poll::Ready(Err(_)) => Poll::Ready(Err(self.abandoned())),
            Poll::Pending => Poll::Pending,
        }
    }
}
