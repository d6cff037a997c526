//! Store-and-forward of a MESSAGE to a user with two devices, one of which is
//! offline until it registers again. Once both devices answered, the fork only
//! lives in the store until the laptop comes back.
//!
//! Run with `cargo run -p rvoip-fork-core --example message_store_and_forward`.

use std::sync::Arc;
use std::time::Duration;

use rvoip_fork_core::logging::{LoggingConfig, setup_logging};
use rvoip_fork_core::message::response;
use rvoip_fork_core::testing::RecordingTransactionLayer;
use rvoip_fork_core::{
    ContactTarget, ForkContextConfig, ForkManagerConfig, ForkResult, ForkRuntime, InMemoryForkStore, Method,
    Request, parse_uri,
};
use rvoip_sip_core::TypedHeader;
use rvoip_sip_core::types::{Address, CSeq, CallId, From, To};
use tracing::{Level, info};

const AOR: &str = "sip:bob@example.com";

fn device(uid: &str, host: &str) -> ForkResult<ContactTarget> {
    Ok(ContactTarget::new(uid, parse_uri(&format!("sip:bob@{}", host))?, 1.0))
}

#[tokio::main]
async fn main() -> ForkResult<()> {
    setup_logging(LoggingConfig::new(Level::DEBUG, "message-demo"))?;

    let config = ForkManagerConfig {
        message: ForkContextConfig::default()
            .with_fork_late(true)
            .with_delivery_timeout(Duration::from_secs(3600))
            .with_urgent_timeout(Duration::from_secs(1)),
        ..Default::default()
    };
    let layer = RecordingTransactionLayer::new();
    let store = Arc::new(InMemoryForkStore::new());
    let runtime = ForkRuntime::new(config, Arc::new(layer.clone()))?.with_store(store.clone());
    let handle = runtime.handle();
    let join = runtime.spawn();

    let aor = parse_uri(AOR)?;
    let mut from = From::new(Address::new(parse_uri("sip:alice@example.com")?));
    from.set_tag("a1");
    let request = Request::new(Method::Message, aor.clone())
        .with_header(TypedHeader::From(from))
        .with_header(TypedHeader::To(To::new(Address::new(aor))))
        .with_header(TypedHeader::CallId(CallId::new("demo-1")))
        .with_header(TypedHeader::CSeq(CSeq::new(1, Method::Message)))
        .with_body("are you there?");
    let fork = handle
        .fork(
            request,
            vec![AOR.to_string()],
            vec![device("<urn:uuid:phone>", "10.0.0.1")?, device("<urn:uuid:laptop>", "10.0.0.2")?],
        )
        .await?;

    // The phone takes the message, the laptop is unreachable
    if let [phone, laptop] = layer.sent_branches(fork).as_slice() {
        handle.response(*phone, Some(response(200)))?;
        handle.response(*laptop, None)?;
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    info!("sender got {:?}, {} fork(s) in store", layer.upstream_statuses(fork), store.len());
    info!("fork offloaded: {:?}", handle.summary(fork).await.err());

    // The laptop comes back on a new address
    handle.new_register(AOR, device("<urn:uuid:laptop>", "10.0.0.9")?)?;
    tokio::time::sleep(Duration::from_millis(50)).await;
    if let Some(retry) = layer.sent_branches(fork).last().copied() {
        handle.response(retry, Some(response(200)))?;
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    info!("sent to {:?}", layer.sent_uris(fork));
    info!("stats: {:?}", handle.stats().await?);
    info!("{} fork(s) left in store", store.len());

    handle.shutdown()?;
    let _ = join.await;
    Ok(())
}
