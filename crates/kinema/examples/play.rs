//! Progressive playback against a real URL.
//!
//! ```sh
//! cargo run --example play -- https://example.com/video.mp4 /tmp/kinema-cache
//! ```

use std::time::Duration;

use kinema::{
    CoordinatorOptions, PlayOptions, PlaybackCoordinator, PlayerEvent, PlayerStatus, Readiness,
};
use kinema_cache::StoreOptions;
use url::Url;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,kinema=debug".into()),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let url: Url = args
        .next()
        .ok_or("usage: play <url> [cache-dir]")?
        .parse()?;
    let cache_dir = args.next().unwrap_or_else(|| "/tmp/kinema-cache".into());

    let coordinator =
        PlaybackCoordinator::new(CoordinatorOptions::new(StoreOptions::new(cache_dir)))?;

    println!("cache key: {}", coordinator.cache_key_for(&url)?);

    let session = coordinator.play(url, PlayOptions::default()).await?;
    let mut events = session.subscribe();

    tokio::spawn({
        let session = session.clone();
        async move {
            // Stand-in renderer: read sequentially in 64 KiB bites.
            let mut offset = 0u64;
            loop {
                session.advance_to(offset);
                match session.readiness() {
                    Readiness::Ready(_) => {
                        let end = offset + 64 * 1024;
                        if session.wait_range(offset..end).await.is_err() {
                            break;
                        }
                        match session.read(offset..end).await {
                            Ok(bytes) if bytes.is_empty() => break,
                            Ok(bytes) => offset += bytes.len() as u64,
                            Err(_) => break,
                        }
                    }
                    Readiness::Buffering(fraction) => {
                        println!("buffering… {:.1}%", fraction * 100.0);
                        tokio::time::sleep(Duration::from_millis(200)).await;
                    }
                    Readiness::Error(e) => {
                        eprintln!("playback error: {e}");
                        break;
                    }
                }
            }
        }
    });

    while let Ok(event) = events.recv().await {
        match event {
            PlayerEvent::StatusChanged { status } => {
                println!("status: {status:?}");
                if matches!(status, PlayerStatus::Finished | PlayerStatus::Stopped) {
                    break;
                }
            }
            PlayerEvent::FileLength { bytes } => println!("length: {bytes} bytes"),
            PlayerEvent::DownloadProgress {
                cache_type,
                covered_ranges,
                expected_size,
                error,
            } => {
                if let Some(error) = error {
                    eprintln!("download error: {error}");
                } else {
                    let covered: u64 = covered_ranges.iter().map(|r| r.end - r.start).sum();
                    println!(
                        "{cache_type:?}: {covered}/{} bytes in {} fragments",
                        expected_size.map_or_else(|| "?".into(), |t| t.to_string()),
                        covered_ranges.len()
                    );
                }
            }
            PlayerEvent::PlayProgress {
                elapsed_seconds,
                total_seconds,
                ..
            } => println!("at {elapsed_seconds:.1}s / {total_seconds:.1}s"),
        }
    }

    Ok(())
}
