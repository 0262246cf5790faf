//! In-process wake-ups for idle consumers.
//!
//! Inserts are announced on a broadcast channel. An announcement either
//! names the inserted event or, when it comes from a queue pool's commit
//! hook, carries no name and wakes every consumer. Consumers treat a match
//! as a hint to drain the queue. Lost or lagged messages are harmless: the
//! idle timeout polls regardless.

use std::collections::HashSet;
use tokio::sync::broadcast;

const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
enum Announcement {
    Event(String),
    Unnamed,
}

/// Publishes inserts to subscribed consumers.
#[derive(Debug, Clone)]
pub struct QueueNotifier {
    tx: broadcast::Sender<Announcement>,
}

impl Default for QueueNotifier {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl QueueNotifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Announces that an event with this name was inserted.
    pub fn notify(&self, name: &str) {
        // No receivers is fine; nobody is idle.
        let _ = self.tx.send(Announcement::Event(name.to_string()));
    }

    /// Announces inserts whose names are unknown. Wakes every subscriber.
    pub fn notify_unnamed(&self) {
        let _ = self.tx.send(Announcement::Unnamed);
    }

    /// Subscribes to announcements for the given event names.
    pub fn subscribe<S: AsRef<str>>(&self, names: &[S]) -> WakeSignal {
        WakeSignal {
            rx: self.tx.subscribe(),
            watch: names.iter().map(|n| n.as_ref().to_string()).collect(),
        }
    }
}

/// A consumer's view of the notifier.
#[derive(Debug)]
pub struct WakeSignal {
    rx: broadcast::Receiver<Announcement>,
    watch: HashSet<String>,
}

impl WakeSignal {
    /// Resolves once a watched name or an unnamed insert is announced.
    ///
    /// A lagged receiver also resolves, since a watched name may have been
    /// among the dropped messages. A closed channel never resolves.
    pub async fn wait(&mut self) {
        loop {
            match self.rx.recv().await {
                Ok(Announcement::Unnamed) => return,
                Ok(Announcement::Event(name)) if self.watch.contains(&name) => return,
                Ok(Announcement::Event(_)) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "queue notifier lagged");
                    return;
                }
                Err(broadcast::error::RecvError::Closed) => std::future::pending::<()>().await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn wakes_only_for_watched_names() {
        let notifier = QueueNotifier::default();
        let mut signal = notifier.subscribe(&["check.failed"]);

        notifier.notify("incident.created");
        let woke = tokio::time::timeout(Duration::from_millis(50), signal.wait()).await;
        assert!(woke.is_err(), "unwatched name should not wake");

        notifier.notify("check.failed");
        tokio::time::timeout(Duration::from_secs(1), signal.wait())
            .await
            .expect("watched name should wake");
    }

    #[tokio::test]
    async fn unnamed_inserts_wake_everyone() {
        let notifier = QueueNotifier::default();
        let mut signal = notifier.subscribe(&["check.failed"]);

        notifier.notify_unnamed();
        tokio::time::timeout(Duration::from_secs(1), signal.wait())
            .await
            .expect("unnamed insert should wake");
    }

    #[tokio::test]
    async fn lagging_counts_as_a_wake_up() {
        let notifier = QueueNotifier::new(1);
        let mut signal = notifier.subscribe(&["a"]);
        notifier.notify("b");
        notifier.notify("b");
        notifier.notify("b");

        tokio::time::timeout(Duration::from_secs(1), signal.wait())
            .await
            .expect("lagged receiver should wake");
    }
}
