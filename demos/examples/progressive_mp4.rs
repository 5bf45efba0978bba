//! Progressively cache a single MP4 and print the playable path as soon as the byte
//! threshold is reached.
//!
//! Usage:
//!   cargo run --example progressive_mp4 -- <mp4-url>

use reel_cache::CacheSettings;
use reel_cache_feed::ReelCache;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,reel_cache=debug".into()),
        )
        .init();

    let url = std::env::args()
        .nth(1)
        .ok_or("usage: progressive_mp4 <mp4-url>")?;

    let cache = ReelCache::open_in_os_temp(CacheSettings::default()).await?;

    let path = cache.get_playable_path(&url, None).await;
    println!("playable path: {path}");

    // Watch the record until the download completes in the background.
    loop {
        match cache.get_progress(&url) {
            Some(fraction) => {
                println!("progress: {:5.1}%", fraction * 100.0);
                if cache.is_cached(&url) {
                    break;
                }
            }
            None => println!("progress: waiting for first bytes"),
        }
        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
    }

    println!("complete: {path}");
    cache.dispose().await;
    Ok(())
}
