//! Online/offline signal.
//!
//! The embedding application owns [`Connectivity`] and flips it from
//! whatever reachability source it has; the sync engine and the status
//! projector hold [`ConnectivityWatch`] receivers.

use tokio::sync::watch;

#[derive(Debug)]
pub struct Connectivity {
    tx: watch::Sender<bool>,
}

#[derive(Debug, Clone)]
pub struct ConnectivityWatch {
    rx: watch::Receiver<bool>,
}

impl Connectivity {
    pub fn new(online: bool) -> Self {
        let (tx, _rx) = watch::channel(online);
        Self { tx }
    }

    pub fn set_online(&self, online: bool) {
        self.tx.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn watch(&self) -> ConnectivityWatch {
        ConnectivityWatch {
            rx: self.tx.subscribe(),
        }
    }
}

impl ConnectivityWatch {
    /// Watch that is permanently online.
    pub fn always_online() -> Self {
        let (_tx, rx) = watch::channel(true);
        Self { rx }
    }

    pub fn is_online(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves on the next change. Pends forever once the sender is gone.
    pub async fn changed(&mut self) -> bool {
        if self.rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
        *self.rx.borrow_and_update()
    }

    /// Resolves once offline. Pends forever once the sender is gone and
    /// the last value was online.
    pub async fn wait_offline(&mut self) {
        loop {
            if !*self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }

    /// Resolves once online.
    pub async fn wait_online(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}
