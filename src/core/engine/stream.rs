use crate::core::Result;
use futures::Stream;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Token {
    pub id: u32,
    pub index: usize,
    pub logit: f32,
}

#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct TokenSender {
    tx: mpsc::Sender<Result<Token>>,
    cancel: CancelHandle,
}

impl TokenSender {
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled() || self.tx.is_closed()
    }

    pub async fn send(&self, item: Result<Token>) -> bool {
        !self.is_cancelled() && self.tx.send(item).await.is_ok()
    }

    // For producers running on a blocking thread.
    pub fn blocking_send(&self, item: Result<Token>) -> bool {
        !self.is_cancelled() && self.tx.blocking_send(item).is_ok()
    }
}

// Pull-based token stream. Cancellation stops production after the token in flight.
#[derive(Debug)]
pub struct TokenStream {
    inner: ReceiverStream<Result<Token>>,
    cancel: CancelHandle,
}

impl TokenStream {
    pub fn channel(buffer: usize) -> (TokenSender, TokenStream) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let cancel = CancelHandle::new();
        (
            TokenSender { tx, cancel: cancel.clone() },
            TokenStream { inner: ReceiverStream::new(rx), cancel },
        )
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub async fn next_token(&mut self) -> Option<Result<Token>> {
        self.next().await
    }

    pub async fn collect_tokens(mut self) -> Result<Vec<Token>> {
        let mut tokens = Vec::new();
        while let Some(token) = self.next().await {
            tokens.push(token?);
        }
        Ok(tokens)
    }
}

impl Stream for TokenStream {
    type Item = Result<Token>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.cancel.is_cancelled() {
            return Poll::Ready(None);
        }
        Pin::new(&mut this.inner).poll_next(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_delivers_in_order() {
        let (tx, stream) = TokenStream::channel(4);
        tokio::spawn(async move {
            for i in 0..3 {
                tx.send(Ok(Token { id: i, index: i as usize, logit: 0.0 })).await;
            }
        });
        let tokens = stream.collect_tokens().await.unwrap();
        assert_eq!(tokens.iter().map(|t| t.id).collect::<Vec<_>>(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_cancel_ends_stream() {
        let (tx, mut stream) = TokenStream::channel(4);
        assert!(tx.send(Ok(Token { id: 7, index: 0, logit: 1.0 })).await);
        stream.cancel_handle().cancel();
        assert!(stream.next_token().await.is_none());
        assert!(tx.is_cancelled());
    }

    #[test]
    fn test_stream_result_can_be_unwrapped_as_error() {
        let rejected: Result<TokenStream> = Err(crate::core::EngineError::unsupported("edge", "streaming"));
        let err = rejected.unwrap_err();
        assert!(matches!(err, crate::core::EngineError::UnsupportedCapability { .. }));

        let (_tx, stream) = TokenStream::channel(1);
        assert!(format!("{:?}", stream).starts_with("TokenStream"));
    }
}
