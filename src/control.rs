use crate::error::DownloadError;
use tokio::sync::watch;

/// External control signal for a running download. Pause carries the
/// human-readable reason surfaced in status records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Control {
    Run,
    Pause(String),
    Cancel,
}

/// Sender half, held by the supervisor and the signal handler.
#[derive(Clone)]
pub struct ControlHandle {
    tx: watch::Sender<Control>,
}

impl ControlHandle {
    pub fn pause(&self, reason: impl Into<String>) {
        let _ = self.tx.send(Control::Pause(reason.into()));
    }

    pub fn cancel(&self) {
        let _ = self.tx.send(Control::Cancel);
    }

    pub fn subscribe(&self) -> ControlRx {
        ControlRx {
            rx: self.tx.subscribe(),
        }
    }
}

/// Receiver half, threaded through every suspension point so workers wake
/// immediately instead of at the next buffer iteration.
#[derive(Clone)]
pub struct ControlRx {
    rx: watch::Receiver<Control>,
}

pub fn channel() -> (ControlHandle, ControlRx) {
    let (tx, rx) = watch::channel(Control::Run);
    (ControlHandle { tx }, ControlRx { rx })
}

impl ControlRx {
    /// Non-blocking check; converts a pending signal into the matching
    /// control-flow error.
    pub fn check(&self) -> Result<(), DownloadError> {
        match &*self.rx.borrow() {
            Control::Run => Ok(()),
            Control::Pause(reason) => Err(DownloadError::Paused(reason.clone())),
            Control::Cancel => Err(DownloadError::Cancelled),
        }
    }

    /// Resolves when a pause or cancel arrives. Intended for `tokio::select!`
    /// against a read or a sleep; never resolves while the state is `Run`.
    pub async fn interrupted(&mut self) -> DownloadError {
        loop {
            if let Err(e) = self.check() {
                return e;
            }
            if self.rx.changed().await.is_err() {
                // Sender dropped: treat as cancellation so workers unwind.
                return DownloadError::Cancelled;
            }
        }
    }

    /// Sleep that honors control signals.
    pub async fn sleep(&mut self, duration: std::time::Duration) -> Result<(), DownloadError> {
        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            err = self.interrupted() => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn check_reflects_latest_signal() {
        let (handle, rx) = channel();
        assert!(rx.check().is_ok());

        handle.pause("taking a break");
        match rx.check() {
            Err(DownloadError::Paused(reason)) => assert_eq!(reason, "taking a break"),
            other => panic!("expected pause, got {other:?}"),
        }

        handle.cancel();
        assert!(matches!(rx.check(), Err(DownloadError::Cancelled)));
    }

    #[tokio::test]
    async fn sleep_is_interrupted_by_cancel() {
        let (handle, mut rx) = channel();
        let sleeper = tokio::spawn(async move {
            rx.sleep(std::time::Duration::from_secs(30)).await
        });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        handle.cancel();
        let result = sleeper.await.unwrap();
        assert!(matches!(result, Err(DownloadError::Cancelled)));
    }
}
