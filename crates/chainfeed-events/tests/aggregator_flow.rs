use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::{address, B256};
use chainfeed_core::{FilterCriteria, LogRecord};
use chainfeed_events::decode::{ATTR_TX_LOG, EVENT_TX_LOG};
use chainfeed_events::{
    AbciEvent, AbciEventDecoder, AggregatorConfig, ChainEventSource, ChannelEventSource,
    EventAggregator, RawBlockEvent, RawTxEvent,
};
use tokio_util::sync::CancellationToken;

fn block(height: u64) -> RawBlockEvent {
    RawBlockEvent {
        height,
        hash: B256::with_last_byte(height as u8),
        ..Default::default()
    }
}

fn evm_tx(height: u64, logs: &[LogRecord]) -> RawTxEvent {
    let mut event = AbciEvent::new(EVENT_TX_LOG);
    for log in logs {
        event = event.with(ATTR_TX_LOG, serde_json::to_string(log).unwrap());
    }
    RawTxEvent {
        height,
        index: 0,
        events: vec![AbciEvent::new("message").with("module", "evm"), event],
    }
}

#[tokio::test]
async fn subscribers_see_headers_in_commit_order() {
    let source = Arc::new(ChannelEventSource::new());
    let agg = EventAggregator::new(
        Arc::clone(&source) as Arc<dyn ChainEventSource>,
        Arc::new(AbciEventDecoder),
        AggregatorConfig::default(),
    );
    let headers = agg.header_stream().await.unwrap();
    let cancel = CancellationToken::new();

    let collector = {
        let headers = Arc::clone(&headers);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut numbers = Vec::new();
            let _ = headers
                .subscribe(&cancel, |batch, _| {
                    numbers.extend(batch.iter().map(|h| h.number));
                    let done = numbers.len() >= 3;
                    async move { if done { Err(()) } else { Ok(()) } }
                })
                .await;
            numbers
        })
    };

    // Let the collector register at the current end of the stream.
    tokio::time::sleep(Duration::from_millis(20)).await;
    for h in 1..=3 {
        source.publish_block(block(h)).await;
    }

    let numbers = tokio::time::timeout(Duration::from_secs(2), collector)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(numbers, vec![1, 2, 3]);
    agg.shutdown().await;
}

#[tokio::test]
async fn logs_flow_through_and_can_be_filtered() {
    let source = Arc::new(ChannelEventSource::new());
    let agg = EventAggregator::new(
        Arc::clone(&source) as Arc<dyn ChainEventSource>,
        Arc::new(AbciEventDecoder),
        AggregatorConfig::default(),
    );
    let logs = agg.log_stream().await.unwrap();

    let a = address!("00000000000000000000000000000000000000aa");
    let b = address!("00000000000000000000000000000000000000bb");
    let emitted = [
        LogRecord { address: a, ..Default::default() },
        LogRecord { address: b, ..Default::default() },
    ];
    source.publish_tx(evm_tx(11, &emitted)).await;

    let cancel = CancellationToken::new();
    let (items, _) = tokio::time::timeout(Duration::from_secs(1), logs.read_blocking(&cancel, 0))
        .await
        .unwrap();
    let matched = chainfeed_core::filter_logs(items, &FilterCriteria::default().address(b));
    assert_eq!(matched.len(), 1);
    assert_eq!(matched[0].block_number, 11);

    agg.shutdown().await;
    assert_eq!(source.subscription_count(), 0);
}
