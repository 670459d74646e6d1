use futures::StreamExt;
use neuron_types::*;

#[tokio::test]
async fn chat_stream_yields_in_order() {
    let stream = ChatStream::new(futures::stream::iter(vec![
        Ok(ChatChunk::content("m1", "Hello")),
        Ok(ChatChunk::content("m1", " world")),
        Ok(ChatChunk::usage_only("m1", CompletionUsage::new(5, 2))),
    ]));
    let chunks: Vec<_> = stream.collect().await;
    assert_eq!(chunks.len(), 3);
    assert_eq!(chunks[0].as_ref().unwrap().text(), Some("Hello"));
    assert!(chunks[2].as_ref().unwrap().usage.is_some());
}

#[tokio::test]
async fn collect_text_concatenates_and_keeps_usage() {
    let stream = ChatStream::new(futures::stream::iter(vec![
        Ok(ChatChunk::content("m1", "Hello")),
        Ok(ChatChunk::content("m1", " world")),
        Ok(ChatChunk::usage_only("m1", CompletionUsage::new(5, 2))),
    ]));
    let (text, usage) = stream.collect_text().await.unwrap();
    assert_eq!(text, "Hello world");
    assert_eq!(usage, Some(CompletionUsage::new(5, 2)));
}

#[tokio::test]
async fn collect_text_stops_at_error() {
    let stream = ChatStream::new(futures::stream::iter(vec![
        Ok(ChatChunk::content("m1", "partial")),
        Err(LlmError::connection("reset", false)),
    ]));
    let err = stream.collect_text().await.unwrap_err();
    assert!(!err.is_retryable());
}
