//! Development producer that echoes the user back

use std::time::Duration;

use async_stream::stream;
use async_trait::async_trait;
use folio_core::{FinishReason, Message, ProducerEvent, ProducerEventStream, Result, Role, Usage};
use folio_session::{Producer, RunConfig};
use tokio_util::sync::CancellationToken;

/// Streams the last user message back one word at a time
pub struct EchoProducer {
    delay: Duration,
}

impl EchoProducer {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl Default for EchoProducer {
    fn default() -> Self {
        Self::new(Duration::from_millis(50))
    }
}

#[async_trait]
impl Producer for EchoProducer {
    async fn run(
        &self,
        messages: Vec<Message>,
        _config: &RunConfig,
        cancel: CancellationToken,
    ) -> Result<ProducerEventStream> {
        let text = messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(Message::text)
            .unwrap_or_default();
        let input_tokens = folio_session::tokens::estimate_text_tokens(&text);
        let words: Vec<String> = text
            .split_inclusive(char::is_whitespace)
            .map(str::to_string)
            .collect();
        let delay = self.delay;

        Ok(Box::pin(stream! {
            let mut output_tokens = 0;
            for word in words {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
                output_tokens += 1;
                yield ProducerEvent::TextDelta { id: "0".into(), text: word };
            }
            yield ProducerEvent::Finish {
                finish_reason: FinishReason::Stop,
                total_usage: Usage {
                    input_tokens,
                    output_tokens,
                    total_tokens: input_tokens + output_tokens,
                },
            };
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_echoes_last_user_message() {
        let producer = EchoProducer::new(Duration::ZERO);
        let messages = vec![
            Message::user("first"),
            Message::assistant("reply"),
            Message::user("hello there world"),
        ];
        let events: Vec<_> = producer
            .run(messages, &RunConfig::default(), CancellationToken::new())
            .await
            .unwrap()
            .collect()
            .await;

        let text: String = events
            .iter()
            .filter_map(|e| match e {
                ProducerEvent::TextDelta { text, .. } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(text, "hello there world");
        assert_eq!(events.len(), 4);
        assert!(events.last().unwrap().is_terminal());
    }

    #[tokio::test]
    async fn test_stops_when_cancelled() {
        let producer = EchoProducer::new(Duration::from_secs(10));
        let cancel = CancellationToken::new();
        let mut stream = producer
            .run(vec![Message::user("a b c")], &RunConfig::default(), cancel.clone())
            .await
            .unwrap();
        cancel.cancel();
        assert!(stream.next().await.is_none());
    }
}
