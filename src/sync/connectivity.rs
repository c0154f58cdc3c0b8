//! Connectivity signal

use tokio::sync::watch;

/// Online/offline flag fed by the platform and observed by the worker
pub struct Connectivity {
    sender: watch::Sender<bool>,
}

impl Connectivity {
    pub fn new(online: bool) -> Self {
        let (sender, _) = watch::channel(online);
        Self { sender }
    }

    pub fn is_online(&self) -> bool {
        *self.sender.borrow()
    }

    /// Returns whether the state changed
    pub fn set(&self, online: bool) -> bool {
        self.sender.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_edges_only() {
        let connectivity = Connectivity::new(true);
        let mut rx = connectivity.subscribe();

        assert!(!connectivity.set(true));
        assert!(!rx.has_changed().unwrap());

        assert!(connectivity.set(false));
        rx.changed().await.unwrap();
        assert!(!*rx.borrow_and_update());
        assert!(!connectivity.is_online());
    }
}
