//! Summarizer used by compaction

use std::sync::Arc;

use async_trait::async_trait;
use folio_core::{Error, Message, ProducerEvent, Result};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::producer::{Producer, RunConfig};

/// Turns a flat transcript into a concise recap
#[async_trait]
pub trait Summarizer: Send + Sync {
    /// Summarize `transcript` following `instruction`, in at most `max_tokens`
    async fn summarize(&self, instruction: &str, transcript: &str, max_tokens: u32)
    -> Result<String>;
}

/// A summarizer that runs the response producer with no tools
pub struct ProducerSummarizer {
    producer: Arc<dyn Producer>,
}

impl ProducerSummarizer {
    pub fn new(producer: Arc<dyn Producer>) -> Self {
        Self { producer }
    }
}

#[async_trait]
impl Summarizer for ProducerSummarizer {
    async fn summarize(
        &self,
        instruction: &str,
        transcript: &str,
        max_tokens: u32,
    ) -> Result<String> {
        let config = RunConfig {
            system_prompt: Some(instruction.to_string()),
            max_tokens: Some(max_tokens),
            temperature: None,
        };
        let cancel = CancellationToken::new();

        let mut events = self
            .producer
            .run(vec![Message::user(transcript)], &config, cancel)
            .await
            .map_err(|e| Error::Summarizer(format!("Summarization call failed: {}", e)))?;

        let mut summary = String::new();
        while let Some(event) = events.next().await {
            match event {
                ProducerEvent::TextDelta { text, .. } => summary.push_str(&text),
                ProducerEvent::Error { message } => {
                    return Err(Error::Summarizer(format!(
                        "Summarization stream failed: {}",
                        message
                    )));
                }
                ProducerEvent::Finish { .. } => break,
                _ => {}
            }
        }

        let summary = summary.trim().to_string();
        if summary.is_empty() {
            return Err(Error::Summarizer(
                "Summarizer returned an empty response".to_string(),
            ));
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ScriptedProducer, text_script};

    #[tokio::test]
    async fn test_collects_text_deltas() {
        let producer = Arc::new(ScriptedProducer::new(vec![text_script("  The user wants X. ")]));
        let summarizer = ProducerSummarizer::new(producer.clone());

        let summary = summarizer
            .summarize("Summarize.", "[User]: X please", 512)
            .await
            .unwrap();
        assert_eq!(summary, "The user wants X.");

        let seen = producer.seen_messages();
        assert_eq!(seen[0][0].text(), "[User]: X please");
    }

    #[tokio::test]
    async fn test_empty_summary_is_an_error() {
        let producer = Arc::new(ScriptedProducer::new(vec![text_script("   ")]));
        let summarizer = ProducerSummarizer::new(producer);
        assert!(summarizer.summarize("Summarize.", "t", 512).await.is_err());
    }

    #[tokio::test]
    async fn test_stream_error_is_an_error() {
        let producer = Arc::new(ScriptedProducer::new(vec![vec![ProducerEvent::Error {
            message: "boom".into(),
        }]]));
        let summarizer = ProducerSummarizer::new(producer);
        let err = summarizer.summarize("Summarize.", "t", 512).await.unwrap_err();
        assert!(err.to_string().contains("boom"));
    }
}
