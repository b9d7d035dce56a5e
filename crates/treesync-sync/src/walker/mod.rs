//! `TreeWalker` implementations
//!
//! Both walkers push entries through an [`EntryEmitter`], which owns the
//! walker's half of the channel contract: it races every send against
//! cancellation and the consumer's failure report, and it makes sure the
//! report is read before the walk returns.

mod local;
mod remote;

pub use local::LocalWalker;
pub use remote::RemoteWalker;

use std::future::Future;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use treesync_core::domain::SnapshotEntry;
use treesync_core::ports::IngestOutcome;

use crate::SyncError;

/// Sending half of a walk
pub(crate) struct EntryEmitter<'a> {
    cancel: &'a CancellationToken,
    entries_out: mpsc::Sender<SnapshotEntry>,
    /// `None` once the consumer's report has been read
    err_in: Option<oneshot::Receiver<IngestOutcome>>,
    sent: u64,
}

impl<'a> EntryEmitter<'a> {
    pub(crate) fn new(
        cancel: &'a CancellationToken,
        entries_out: mpsc::Sender<SnapshotEntry>,
        err_in: oneshot::Receiver<IngestOutcome>,
    ) -> Self {
        Self {
            cancel,
            entries_out,
            err_in: Some(err_in),
            sent: 0,
        }
    }

    pub(crate) fn cancel(&self) -> &CancellationToken {
        self.cancel
    }

    /// Hands one entry to the consumer
    ///
    /// Fails with [`SyncError::Cancelled`] on cancellation and with
    /// [`SyncError::ConsumerFailed`] once the consumer has stopped.
    pub(crate) async fn emit(&mut self, entry: SnapshotEntry) -> Result<(), SyncError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(SyncError::Cancelled),
            report = next_report(&mut self.err_in) => {
                self.err_in = None;
                Err(consumer_error(report, "consumer finished before the walk did"))
            }
            sent = self.entries_out.send(entry) => match sent {
                Ok(()) => {
                    self.sent += 1;
                    Ok(())
                }
                // Receiver dropped: the report explains why.
                Err(_) => Err(self.take_report_error().await),
            },
        }
    }

    /// Closes the entry channel and waits for the consumer's count
    pub(crate) async fn finish(self) -> Result<u64, SyncError> {
        let Self {
            entries_out,
            err_in,
            sent,
            ..
        } = self;
        drop(entries_out);

        let report = match err_in {
            Some(rx) => rx.await,
            None => return Err(SyncError::ConsumerFailed("report already consumed".into())),
        };
        match report {
            Ok(Ok(stored)) => {
                debug!(sent, stored, "Walk finished");
                Ok(stored)
            }
            other => Err(consumer_error(other, "consumer finished before the walk did")),
        }
    }

    /// Closes the entry channel after a walker-side failure
    ///
    /// The consumer's report is still drained so the failure channel is
    /// read exactly once; the walker's own error wins.
    pub(crate) async fn abort(self, error: SyncError) -> SyncError {
        let Self {
            entries_out,
            err_in,
            sent,
            ..
        } = self;
        drop(entries_out);

        if let Some(rx) = err_in {
            if let Ok(Err(consumer)) = rx.await {
                debug!(error = %consumer, "Consumer also failed during aborted walk");
            }
        }
        debug!(sent, error = %error, "Walk aborted");
        error
    }

    async fn take_report_error(&mut self) -> SyncError {
        match self.err_in.take() {
            Some(rx) => consumer_error(rx.await, "consumer closed the entry channel"),
            None => SyncError::ConsumerFailed("consumer closed the entry channel".into()),
        }
    }
}

/// Resolves with the consumer's report, or never if it was already read
fn next_report(
    err_in: &mut Option<oneshot::Receiver<IngestOutcome>>,
) -> impl Future<Output = Result<IngestOutcome, oneshot::error::RecvError>> + '_ {
    async move {
        match err_in {
            Some(rx) => rx.await,
            None => std::future::pending().await,
        }
    }
}

fn consumer_error(
    report: Result<IngestOutcome, oneshot::error::RecvError>,
    unexpected_ok: &str,
) -> SyncError {
    match report {
        Ok(Err(e)) => SyncError::ConsumerFailed(format!("{e:#}")),
        Ok(Ok(_)) => SyncError::ConsumerFailed(unexpected_ok.to_string()),
        Err(_) => SyncError::ConsumerFailed("consumer vanished without reporting".into()),
    }
}
