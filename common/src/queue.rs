//! Bounded hand-off of transfer tokens from the coordinator to the worker pool.

use crate::classify::TransferToken;

/// Producer side of a bounded FIFO of tokens with room for `capacity` un-dequeued entries.
///
/// The coordinator owns the queue and is its only producer; workers hold [`TokenReceiver`]s.
/// `enqueue` waits while the queue is full and fails once every receiver is gone or one of them
/// closed the queue. Dropping the queue (or calling [`TransferQueue::close`]) lets receivers
/// drain what is left and then see `None`.
#[derive(Debug)]
pub struct TransferQueue {
    send: async_channel::Sender<TransferToken>,
}

/// Consumer side of a [`TransferQueue`]; `dequeue` waits while the queue is empty.
#[derive(Debug, Clone)]
pub struct TokenReceiver {
    recv: async_channel::Receiver<TransferToken>,
}

impl TransferQueue {
    pub fn bounded(capacity: std::num::NonZeroUsize) -> (Self, TokenReceiver) {
        let (send, recv) = async_channel::bounded(capacity.get());
        (Self { send }, TokenReceiver { recv })
    }

    pub async fn enqueue(&self, token: TransferToken) -> anyhow::Result<()> {
        self.send
            .send(token)
            .await
            .map_err(|err| anyhow::anyhow!("transfer queue closed, dropped {:?}", err.0.name))
    }

    pub fn close(&self) {
        self.send.close();
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.send.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.send.is_empty()
    }

    #[cfg(test)]
    pub fn capacity(&self) -> usize {
        self.send.capacity().unwrap_or(usize::MAX)
    }
}

impl TokenReceiver {
    pub async fn dequeue(&self) -> Option<TransferToken> {
        self.recv.recv().await.ok()
    }

    /// Stops the producer: pending and future `enqueue` calls fail.
    pub fn close(&self) {
        self.recv.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::num::NonZeroUsize;
    use std::sync::Arc;

    fn token(name: &str) -> TransferToken {
        TransferToken::from_name(name.into())
    }

    #[tokio::test]
    async fn fifo_then_none_after_close() -> anyhow::Result<()> {
        let (queue, receiver) = TransferQueue::bounded(NonZeroUsize::new(3).unwrap());
        queue.enqueue(token("a")).await?;
        queue.enqueue(token("b")).await?;
        queue.close();
        assert_eq!(receiver.dequeue().await, Some(token("a")));
        assert_eq!(receiver.dequeue().await, Some(token("b")));
        assert_eq!(receiver.dequeue().await, None);
        assert!(queue.enqueue(token("c")).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn dropping_the_queue_releases_receivers() -> anyhow::Result<()> {
        let (queue, receiver) = TransferQueue::bounded(NonZeroUsize::new(1).unwrap());
        queue.enqueue(token("a")).await?;
        drop(queue);
        assert_eq!(receiver.dequeue().await, Some(token("a")));
        assert_eq!(receiver.dequeue().await, None);
        Ok(())
    }

    #[tokio::test]
    async fn enqueue_fails_without_receivers() -> anyhow::Result<()> {
        let (queue, receiver) = TransferQueue::bounded(NonZeroUsize::new(1).unwrap());
        receiver.close();
        assert!(queue.enqueue(token("a")).await.is_err());
        let (queue, receiver) = TransferQueue::bounded(NonZeroUsize::new(1).unwrap());
        drop(receiver);
        assert!(queue.enqueue(token("a")).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn enqueue_waits_while_full() -> anyhow::Result<()> {
        let (queue, receiver) = TransferQueue::bounded(NonZeroUsize::new(2).unwrap());
        let queue = Arc::new(queue);
        assert_eq!(queue.capacity(), 2);
        queue.enqueue(token("a")).await?;
        queue.enqueue(token("b")).await?;
        assert_eq!(queue.len(), 2);
        let producer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.enqueue(token("c")).await })
        };
        tokio::task::yield_now().await;
        assert!(!producer.is_finished());
        assert_eq!(queue.len(), 2);
        assert_eq!(receiver.dequeue().await, Some(token("a")));
        producer.await??;
        assert_eq!(queue.len(), 2);
        assert_eq!(receiver.dequeue().await, Some(token("b")));
        assert_eq!(receiver.dequeue().await, Some(token("c")));
        assert!(queue.is_empty());
        Ok(())
    }
}
