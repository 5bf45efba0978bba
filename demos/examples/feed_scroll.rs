//! Simulate a scrolled reel feed: hand the controller a URL list and walk the index while
//! it prefetches around the viewport and cancels what falls out of the keep window.
//!
//! Usage:
//!   cargo run --example feed_scroll -- <url> [<url> ...]

use std::time::Duration;

use reel_cache::CacheSettings;
use reel_cache_feed::{ConnectivityHint, ReelCache};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let urls: Vec<String> = std::env::args().skip(1).collect();
    if urls.is_empty() {
        return Err("usage: feed_scroll <url> [<url> ...]".into());
    }

    let cache = ReelCache::open_in_os_temp(CacheSettings::default()).await?;
    cache.update_from_connectivity(ConnectivityHint {
        is_wifi: true,
        is_mobile: false,
    });

    for index in 0..urls.len() {
        println!("--- viewing reel {index} ---");
        cache.on_scroll_update(&urls, index, None).await;

        let path = cache.get_playable_path(&urls[index], None).await;
        println!("play: {path}");

        for url in &urls {
            if let Some(fraction) = cache.get_progress(url) {
                println!("  {:5.1}%  {url}", fraction * 100.0);
            }
        }
        tokio::time::sleep(Duration::from_secs(2)).await;
    }

    cache.dispose().await;
    Ok(())
}
