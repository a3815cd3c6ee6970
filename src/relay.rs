use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::delivery::{
    DeliveryBatcher, DeliveryStats, DeliveryTarget, LiveMessageSurface, DEFAULT_DEBOUNCE,
};
use crate::error::{RelayError, Result};
use crate::models::ResponseMetadata;
use crate::stream::{DeltaSource, ReconcileStats, StreamReconciler, Submission};

#[derive(Debug, Clone, Copy)]
pub struct RelaySettings {
    pub debounce: Duration,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            debounce: DEFAULT_DEBOUNCE,
        }
    }
}

/// Summary of one relayed response.
#[derive(Debug, Clone)]
pub struct RelayOutcome {
    pub run_id: Uuid,
    pub resource_id: String,
    pub chat_id: Option<String>,
    pub metadata: ResponseMetadata,
    pub delivery: DeliveryStats,
    pub reconcile: ReconcileStats,
    pub finished_at: DateTime<Utc>,
}

/// Relay one inbound delta stream to a live message on `surface`.
///
/// The live message is opened before anything is read. If that fails nothing
/// is consumed. A stream error closes the live message with an error notice
/// and is then returned.
pub async fn relay_stream(
    surface: Arc<dyn LiveMessageSurface>,
    target: DeliveryTarget,
    source: DeltaSource,
    settings: RelaySettings,
) -> Result<RelayOutcome> {
    let run_id = Uuid::now_v7();
    log::info!("🚀 Relay run {} to {}", run_id, target.channel);

    if source.is_locked() {
        return Err(RelayError::invalid_state(format!(
            "source {} has already been consumed",
            source.id()
        )));
    }

    let mut batcher = DeliveryBatcher::new(surface, target, settings.debounce);
    let resource_id = batcher.start().await?;

    let mut reconciler = StreamReconciler::new();
    let events = reconciler.event_channel();
    let delivery = tokio::spawn(batcher.run(events));

    let processed = reconciler.process(&source).await;
    let reconcile = reconciler.stats();
    drop(reconciler);

    let report = delivery
        .await
        .map_err(|e| RelayError::internal(format!("delivery task failed: {}", e)))?;

    match processed? {
        Submission::Processed => {}
        other => {
            return Err(RelayError::invalid_state(format!(
                "source {} was not processed: {:?}",
                source.id(),
                other
            )));
        }
    }

    log::info!(
        "✅ Relay run {} finished on {}: {} batches, {} chars, {} patches",
        run_id,
        report.live.id().unwrap_or_default(),
        report.stats.batches,
        report.stats.chars_sent,
        reconcile.patches_applied
    );

    Ok(RelayOutcome {
        run_id,
        resource_id,
        chat_id: report.metadata.id.clone(),
        metadata: report.metadata,
        delivery: report.stats,
        reconcile,
        finished_at: Utc::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::surface::testing::{RecordingSurface, SurfaceCall};
    use crate::delivery::ERROR_NOTICE;
    use crate::error::ErrorCode;
    use bytes::Bytes;
    use std::sync::atomic::Ordering;

    fn target() -> DeliveryTarget {
        DeliveryTarget {
            channel: "C123".to_string(),
            thread: None,
        }
    }

    const RESPONSE: &str = concat!(
        "data: {\"type\":\"connected\"}\n",
        "data: {\"object\":\"chat\",\"id\":\"chat-42\",\"webUrl\":\"https://example.test/chat/42\"}\n",
        "data: {\"delta\":{\"_t\":\"a\",\"0\":[[0,[[\"p\",{},\"Hel\"]]]]}}\n",
        "data: {\"delta\":[[0,1,0,2,\"lo\"],9,9]}\n",
        "data: [DONE]\n",
    );

    #[tokio::test(start_paused = true)]
    async fn test_relay_end_to_end() {
        let surface = RecordingSurface::new();
        let outcome = relay_stream(
            surface.clone(),
            target(),
            DeltaSource::from_bytes(RESPONSE),
            RelaySettings::default(),
        )
        .await
        .unwrap();

        assert_eq!(outcome.resource_id, "1700000000.000100");
        assert_eq!(outcome.chat_id.as_deref(), Some("chat-42"));
        assert_eq!(outcome.reconcile.patches_applied, 2);
        assert_eq!(surface.appended().concat(), "Hello");

        let calls = surface.calls();
        assert!(matches!(calls.first(), Some(SurfaceCall::Start { .. })));
        match calls.last() {
            Some(SurfaceCall::Stop { final_text, actions, .. }) => {
                assert_eq!(final_text, &None);
                assert_eq!(actions[0].text, "Open chat");
            }
            other => panic!("expected stop, got {:?}", other),
        }
    }

    async fn relayed_text(stream: &'static str) -> String {
        let surface = RecordingSurface::new();
        relay_stream(
            surface.clone(),
            target(),
            DeltaSource::from_bytes(stream),
            RelaySettings::default(),
        )
        .await
        .unwrap();
        surface.appended().concat()
    }

    #[tokio::test(start_paused = true)]
    async fn test_streamed_bold_arrives_intact() {
        let stream = concat!(
            "{\"delta\":{\"_t\":\"a\",\"0\":[[0,[[\"strong\",{},\"Hel\"]]]]}}\n",
            "{\"delta\":[[0,1,0,2,\"lo\"],9,9]}\n",
        );
        assert_eq!(relayed_text(stream).await, "*Hello*");
    }

    #[tokio::test(start_paused = true)]
    async fn test_streamed_code_block_arrives_intact() {
        let stream = concat!(
            "{\"delta\":{\"_t\":\"a\",\"0\":[[0,[[\"Codeblock\",{\"lang\":\"rs\"},\"let x\"]]]]}}\n",
            "{\"delta\":[[0,1,0,2,\" = 1;\"],9,9]}\n",
            "{\"delta\":{\"_t\":\"a\",\"0\":{\"_t\":\"a\",\"1\":{\"_t\":\"a\",\"1\":[\"done\"]}}}}\n",
        );
        assert_eq!(relayed_text(stream).await, "```rs\nlet x = 1;\n```\ndone");
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_line_is_skipped() {
        let stream = concat!(
            "{\"delta\":{\"_t\":\"a\",\"0\":[[0,[\"a\"]]]}}\n",
            "{not json\n",
            "{\"delta\":[[0,1,0,\"b\"],9,9]}\n",
        );
        let surface = RecordingSurface::new();
        let outcome = relay_stream(
            surface.clone(),
            target(),
            DeltaSource::from_bytes(stream),
            RelaySettings::default(),
        )
        .await
        .unwrap();

        assert_eq!(surface.appended().concat(), "ab");
        assert_eq!(outcome.reconcile.patches_applied, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_error_stops_with_notice() {
        let chunks: Vec<Result<Bytes>> = vec![
            Ok(Bytes::from_static(b"{\"delta\":{\"_t\":\"a\",\"0\":[[0,[\"partial\"]]]}}\n")),
            Err(RelayError::stream("connection reset")),
        ];
        let surface = RecordingSurface::new();
        let err = relay_stream(
            surface.clone(),
            target(),
            DeltaSource::new(futures::stream::iter(chunks)),
            RelaySettings::default(),
        )
        .await
        .unwrap_err();

        assert_eq!(err.code, ErrorCode::StreamIo);
        assert_eq!(surface.appended(), vec!["partial".to_string()]);
        assert!(matches!(
            surface.calls().last(),
            Some(SurfaceCall::Stop { final_text: Some(text), .. }) if text == ERROR_NOTICE
        ));
    }

    #[tokio::test]
    async fn test_start_failure_consumes_nothing() {
        let surface = RecordingSurface::new();
        surface.fail_start.store(true, Ordering::SeqCst);
        let source = DeltaSource::from_bytes(RESPONSE);

        let err = relay_stream(surface.clone(), target(), source.clone(), RelaySettings::default())
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::Delivery);
        assert!(surface.calls().is_empty());
        assert!(!source.is_locked());
    }

    #[tokio::test]
    async fn test_consumed_source_is_rejected() {
        let source = DeltaSource::from_bytes(RESPONSE);
        StreamReconciler::new().process(&source).await.unwrap();

        let surface = RecordingSurface::new();
        let err = relay_stream(surface.clone(), target(), source, RelaySettings::default())
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidState);
        assert!(surface.calls().is_empty());
    }
}
