//! Consensus notifications, dispatched in acceptance order with the DAG
//! lock released so listeners may query the DAG freely.

use std::sync::{Arc, Mutex};

use dagd_consensus::Hash256;
use dagd_primitives::block::Block;

#[derive(Clone, Debug)]
pub enum Notification {
    BlockAdded {
        block: Arc<Block>,
        was_unorphaned: bool,
    },
    ChainChanged {
        removed_chain_block_hashes: Vec<Hash256>,
        added_chain_block_hashes: Vec<Hash256>,
    },
    FinalityConflict {
        violating_block_hash: Hash256,
    },
    FinalityConflictResolved {
        finality_block_hash: Hash256,
    },
}

type Listener = Box<dyn Fn(&Notification) + Send + Sync>;

#[derive(Default)]
pub struct ConsensusNotifier {
    listeners: Mutex<Vec<Listener>>,
}

impl ConsensusNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, listener: impl Fn(&Notification) + Send + Sync + 'static) {
        self.listeners
            .lock()
            .expect("notifier lock")
            .push(Box::new(listener));
    }

    pub fn notify(&self, notification: &Notification) {
        let listeners = self.listeners.lock().expect("notifier lock");
        for listener in listeners.iter() {
            listener(notification);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn listeners_receive_notifications_in_order() {
        let notifier = ConsensusNotifier::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        notifier.subscribe(move |notification| {
            if let Notification::FinalityConflict {
                violating_block_hash,
            } = notification
            {
                seen_clone.lock().expect("lock").push(*violating_block_hash);
            }
        });

        notifier.notify(&Notification::FinalityConflict {
            violating_block_hash: [1u8; 32],
        });
        notifier.notify(&Notification::FinalityConflict {
            violating_block_hash: [2u8; 32],
        });

        assert_eq!(*seen.lock().expect("lock"), vec![[1u8; 32], [2u8; 32]]);
    }

    #[test]
    fn multiple_listeners_all_fire() {
        let notifier = ConsensusNotifier::new();
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let count = Arc::clone(&count);
            notifier.subscribe(move |_| {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }
        notifier.notify(&Notification::ChainChanged {
            removed_chain_block_hashes: Vec::new(),
            added_chain_block_hashes: Vec::new(),
        });
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }
}
