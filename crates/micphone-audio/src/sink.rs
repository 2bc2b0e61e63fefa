//! Paced PCM output for the software mixer.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::{AudioError, SoftwareMixer};

/// Output pacing for [`PcmSink`].
#[derive(Debug, Clone, Copy)]
pub struct SinkConfig {
    /// Samples per second written to the output.
    pub sample_rate: u32,
    /// Length of each written frame in milliseconds.
    pub frame_ms: u32,
}

impl SinkConfig {
    /// Mono samples per frame.
    pub fn samples_per_frame(&self) -> usize {
        let samples = u64::from(self.sample_rate) * u64::from(self.frame_ms) / 1000;
        usize::try_from(samples).unwrap_or(usize::MAX).max(1)
    }
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            frame_ms: 20,
        }
    }
}

/// Writes one mixed frame per tick as signed 16-bit little-endian PCM.
pub struct PcmSink {
    mixer: Arc<SoftwareMixer>,
    config: SinkConfig,
}

impl PcmSink {
    pub fn new(mixer: Arc<SoftwareMixer>, config: SinkConfig) -> Self {
        Self { mixer, config }
    }

    /// Run until `shutdown` flips to `true` or its sender is dropped.
    ///
    /// Returns the number of frames written.
    pub async fn run<W>(&self, mut out: W, mut shutdown: watch::Receiver<bool>) -> Result<u64, AudioError>
    where
        W: AsyncWrite + Unpin,
    {
        let mut frame = vec![0i16; self.config.samples_per_frame()];
        let mut bytes = Vec::with_capacity(frame.len() * 2);
        let mut ticker =
            tokio::time::interval(Duration::from_millis(u64::from(self.config.frame_ms.max(1))));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut written = 0u64;

        info!(
            sample_rate = self.config.sample_rate,
            frame_ms = self.config.frame_ms,
            "PCM sink running"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    self.mixer.mix_into(&mut frame);
                    bytes.clear();
                    bytes.extend(frame.iter().flat_map(|s| s.to_le_bytes()));
                    out.write_all(&bytes).await?;
                    written += 1;
                }
            }
        }

        out.flush().await?;
        debug!(frames = written, "PCM sink stopped");
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_size_from_rate() {
        assert_eq!(SinkConfig::default().samples_per_frame(), 960);
        let tiny = SinkConfig {
            sample_rate: 10,
            frame_ms: 1,
        };
        assert_eq!(tiny.samples_per_frame(), 1);
    }

    #[tokio::test]
    async fn writes_silence_until_shutdown() {
        let mixer = Arc::new(SoftwareMixer::default());
        let sink = PcmSink::new(
            mixer,
            SinkConfig {
                sample_rate: 8_000,
                frame_ms: 5,
            },
        );
        let (tx, rx) = watch::channel(false);
        let mut out = Vec::new();

        let stopper = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            let _ = tx.send(true);
        });
        let frames = sink.run(&mut out, rx).await.unwrap();
        stopper.await.unwrap();

        assert!(frames >= 1);
        assert_eq!(out.len() as u64, frames * 40 * 2);
        assert!(out.iter().all(|b| *b == 0));
    }
}
