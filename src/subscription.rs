// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Subscription Handle
//!
//! A running consumer as a scoped resource. The handle owns the consumer's
//! channel and delivery task; releasing it cancels the consumer and closes
//! the channel, which returns unacknowledged deliveries to the queue.
//! Dropping a handle that was never released aborts the task and closes the
//! channel in the background.

use crate::{broker::AmqpChannel, errors::AmqpError};
use std::sync::Arc;
use tokio::{runtime::Handle, task::JoinHandle};
use tracing::{debug, warn};

pub struct SubscriptionHandle {
    channel: Arc<dyn AmqpChannel>,
    queue: String,
    consumer_tag: String,
    task: Option<JoinHandle<()>>,
    released: bool,
}

impl SubscriptionHandle {
    pub(crate) fn new(
        channel: Arc<dyn AmqpChannel>,
        queue: &str,
        consumer_tag: &str,
        task: JoinHandle<()>,
    ) -> SubscriptionHandle {
        SubscriptionHandle {
            channel,
            queue: queue.to_owned(),
            consumer_tag: consumer_tag.to_owned(),
            task: Some(task),
            released: false,
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    /// Whether the delivery loop has ended.
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Waits until the delivery loop ends, which happens when the broker
    /// cancels the consumer or the channel goes away.
    ///
    /// Cancel safe: the handle keeps owning the task until it has ended.
    pub async fn closed(&mut self) {
        if let Some(task) = self.task.as_mut() {
            let ended = task.await;
            self.task = None;

            if let Err(err) = ended {
                warn!(error = err.to_string(), "delivery task ended abnormally");
            }
        }
    }

    /// Cancels the consumer and closes its channel once in-flight deliveries
    /// are settled. Unacknowledged deliveries return to the queue.
    pub async fn unsubscribe(mut self) -> Result<(), AmqpError> {
        self.release(false).await
    }

    /// Like `unsubscribe`, then deletes the queue with whatever it still holds.
    pub async fn unsubscribe_and_delete(mut self) -> Result<(), AmqpError> {
        self.release(true).await
    }

    async fn release(&mut self, delete: bool) -> Result<(), AmqpError> {
        self.released = true;

        if !self.is_finished() {
            if let Err(err) = self.channel.cancel(&self.consumer_tag).await {
                warn!(
                    error = err.to_string(),
                    consumer = self.consumer_tag.as_str(),
                    "failure to cancel consumer"
                );
            }
        }

        self.closed().await;

        let deleted = if delete {
            self.channel.delete_queue(&self.queue).await
        } else {
            Ok(())
        };

        let closed = self.channel.close().await;
        debug!("subscription on queue: {} was released", self.queue);

        deleted.and(closed)
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        if let Some(task) = self.task.take() {
            task.abort();
        }

        if let Ok(runtime) = Handle::try_current() {
            let channel = self.channel.clone();
            runtime.spawn(async move {
                if let Err(err) = channel.close().await {
                    warn!(error = err.to_string(), "failure to close dropped subscription");
                }
            });
        }
    }
}
