//! Reactive cells for driving query parameters.
//!
//! A [`Signal`] is the writer half, an [`AttachValue`] the readable and
//! subscribable half. Built on `tokio::sync::watch`, so a cell can feed any
//! number of stores and a dropped writer simply ends the change stream.

use tokio::sync::watch;

/// Writer half of a reactive cell.
#[derive(Debug)]
pub struct Signal<T> {
    tx: watch::Sender<T>,
}

impl<T> Signal<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    #[must_use]
    pub fn new(initial: T) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    /// Store a new value. Returns `false` when the value is equal to the
    /// current one, in which case no notification is sent.
    pub fn set(&self, value: T) -> bool {
        self.tx.send_if_modified(|current| {
            if *current == value {
                false
            } else {
                *current = value;
                true
            }
        })
    }

    #[must_use]
    pub fn get(&self) -> T {
        self.tx.borrow().clone()
    }

    /// Obtain the readable half to hand to a query store.
    #[must_use]
    pub fn attach(&self) -> AttachValue<T> {
        AttachValue {
            rx: self.tx.subscribe(),
        }
    }
}

/// Readable half of a reactive cell: a current value plus change
/// notification.
#[derive(Debug, Clone)]
pub struct AttachValue<T> {
    rx: watch::Receiver<T>,
}

impl<T: Clone> AttachValue<T> {
    #[must_use]
    pub fn value(&self) -> T {
        self.rx.borrow().clone()
    }

    pub(crate) fn receiver(&self) -> watch::Receiver<T> {
        self.rx.clone()
    }
}

/// Create a standalone reactive cell.
#[must_use]
pub fn signal<T>(initial: T) -> Signal<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    Signal::new(initial)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_signal_set_and_read() {
        let sig = signal(1);
        let cell = sig.attach();
        assert_eq!(cell.value(), 1);

        assert!(sig.set(2));
        assert_eq!(cell.value(), 2);
        assert_eq!(sig.get(), 2);
    }

    #[tokio::test]
    async fn test_equal_value_does_not_notify() {
        let sig = signal("a".to_string());
        let cell = sig.attach();
        let mut rx = cell.receiver();

        assert!(!sig.set("a".to_string()));
        assert!(!rx.has_changed().unwrap());

        assert!(sig.set("b".to_string()));
        assert!(rx.has_changed().unwrap());
    }

    #[tokio::test]
    async fn test_change_notification() {
        let sig = signal(0);
        let mut rx = sig.attach().receiver();

        sig.set(5);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), 5);
    }
}
