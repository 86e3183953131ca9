use std::{
    pin::Pin,
    task::{Context, Poll},
};

use futures_channel::mpsc;
use futures_util::{Stream, StreamExt};

use crate::{error::ClientError, multiplexer::Observer, result::OperationResult, subscription::Subscription};

pub(crate) struct ChannelObserver {
    sender: mpsc::UnboundedSender<OperationResult>,
}

impl ChannelObserver {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<OperationResult>) {
        let (sender, receiver) = mpsc::unbounded();
        (ChannelObserver { sender }, receiver)
    }
}

impl Observer for ChannelObserver {
    fn on_next(&self, result: &OperationResult) {
        // The receiver is gone when the stream was dropped.
        self.sender.unbounded_send(result.clone()).ok();
    }

    fn on_error(&self, _error: &ClientError) {
        self.sender.close_channel();
    }

    fn on_complete(&self) {
        self.sender.close_channel();
    }
}

/// The results of a [`Subscription`], ending after the first terminal one.
///
/// Dropping the stream unsubscribes.
pub struct ResultStream {
    receiver: mpsc::UnboundedReceiver<OperationResult>,
    subscription: Subscription,
}

impl ResultStream {
    pub(crate) fn new(receiver: mpsc::UnboundedReceiver<OperationResult>, subscription: Subscription) -> Self {
        ResultStream { receiver, subscription }
    }

    /// Skips loading results.
    pub async fn next_settled(&mut self) -> Option<OperationResult> {
        while let Some(result) = self.next().await {
            if result.is_settled() {
                return Some(result);
            }
        }

        None
    }

    pub fn subscription(&self) -> &Subscription {
        &self.subscription
    }

    pub fn subscription_mut(&mut self) -> &mut Subscription {
        &mut self.subscription
    }
}

impl Stream for ResultStream {
    type Item = OperationResult;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_next_unpin(cx)
    }
}

impl std::fmt::Debug for ResultStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultStream")
            .field("subscription", &self.subscription)
            .finish_non_exhaustive()
    }
}
