use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use futures::channel::mpsc::UnboundedReceiver;

use super::ids::ConversationId;
use super::types::{ConversationState, ConversationStateEvent};

/// Per-conversation state subscription that ends after the first deletion outcome.
///
/// Dropping the listener closes the channel, which is how the engine learns the
/// subscriber went away.
#[derive(Debug)]
pub struct StateListener {
    conversation_id: ConversationId,
    receiver: UnboundedReceiver<ConversationState>,
    fired: bool,
}

impl StateListener {
    pub fn new(
        conversation_id: ConversationId,
        receiver: UnboundedReceiver<ConversationState>,
    ) -> Self {
        Self {
            conversation_id,
            receiver,
            fired: false,
        }
    }

    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }
}

impl Stream for StateListener {
    type Item = ConversationStateEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.fired {
            return Poll::Ready(None);
        }

        match Pin::new(&mut self.receiver).poll_next(cx) {
            Poll::Ready(Some(state)) => {
                if state.is_deletion_outcome() {
                    self.fired = true;
                    self.receiver.close();
                }
                Poll::Ready(Some(ConversationStateEvent {
                    conversation_id: self.conversation_id.clone(),
                    state,
                }))
            }
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}
