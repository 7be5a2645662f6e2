use std::sync::Arc;

use eventstream_gateway::{
    Checkpoint, CompletionHook, ErrorHandling, EventRecord, GatewayConfig, MemoryKvStore,
    StreamRegistry, StreamSpec,
};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let registry = Arc::new(StreamRegistry::new(
        GatewayConfig::default(),
        Arc::new(MemoryKvStore::new()),
    ));

    let spec = registry
        .add_stream(
            StreamSpec::webhook("https://example.com/hook")
                .with_batch_size(10)
                .with_batch_timeout_ms(500)
                .with_error_handling(ErrorHandling::Skip)
                .with_retry_timeout_sec(2),
        )
        .await
        .expect("stream spec rejected");
    let stream = registry.stream(&spec.id).await.expect("stream running");

    // Stand-in for the polling feeder: a few decoded transfer logs, each
    // carrying a hook that advances the persisted watermark once its batch
    // is acknowledged (or skipped after the retry budget).
    for (block, value) in [(150_665u64, "42"), (150_676, "1977"), (150_721, "20151021")] {
        let registry = registry.clone();
        let stream_id = spec.id.clone();
        let record = EventRecord::new("sub-transfers")
            .with_address("0x167f57a13a9c35ff92f0649d2be0e52b4f8ac3ca")
            .with_position(block.to_string(), "0x2b4f", "0")
            .with_field("value", value)
            .with_completion(CompletionHook::new(move |record| {
                let block = record.block_number.parse().unwrap_or_default();
                let checkpoint = Checkpoint::new(stream_id.clone(), block);
                let registry = registry.clone();
                tokio::spawn(async move {
                    let _ = registry.save_checkpoint(&checkpoint).await;
                });
            }));

        stream
            .handle_event(record)
            .await
            .expect("stream stopped early");
    }

    tokio::time::sleep(std::time::Duration::from_secs(5)).await;

    match registry.load_checkpoint(&spec.id).await {
        Ok(Some(checkpoint)) => println!("watermark at block {}", checkpoint.block_number),
        Ok(None) => println!("no checkpoint written"),
        Err(err) => println!("checkpoint load failed: {err}"),
    }

    registry.close().await;
}
