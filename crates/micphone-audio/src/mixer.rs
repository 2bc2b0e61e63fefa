//! In-process software mixing group.
//!
//! Each joined stream gets a reader thread decoding signed 16-bit
//! little-endian mono PCM from its connection into a bounded buffer.
//! [`SoftwareMixer::mix_into`] drains all buffers into one frame.

use std::collections::{BTreeMap, VecDeque};
use std::io::{ErrorKind, Read};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{AudioError, AudioStream, MixingGroup, StreamId};

const READ_CHUNK: usize = 4096;

/// Software mixer settings.
#[derive(Debug, Clone, Copy)]
pub struct MixerConfig {
    /// Per-stream buffer cap; the oldest samples are dropped beyond it.
    pub max_buffered_samples: usize,
}

impl Default for MixerConfig {
    fn default() -> Self {
        Self {
            // Two seconds at 48 kHz.
            max_buffered_samples: 96_000,
        }
    }
}

type SampleBuffer = Arc<Mutex<VecDeque<i16>>>;

struct MixerStream {
    remote: SocketAddr,
    buffer: SampleBuffer,
    finished: Arc<AtomicBool>,
    control: TcpStream,
    reader: Option<JoinHandle<()>>,
}

impl MixerStream {
    fn close(&mut self) {
        match self.control.shutdown(Shutdown::Both) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotConnected => {}
            Err(e) => {
                warn!(remote = %self.remote, error = %e, "failed to shut down stream socket");
            }
        }
        if let Some(reader) = self.reader.take() {
            if reader.join().is_err() {
                warn!(remote = %self.remote, "stream reader thread panicked");
            }
        }
    }

    fn is_drained(&self) -> bool {
        self.finished.load(Ordering::SeqCst) && lock(&self.buffer).is_empty()
    }
}

/// Mixing group that sums inbound PCM streams in software.
pub struct SoftwareMixer {
    config: MixerConfig,
    streams: Mutex<BTreeMap<StreamId, MixerStream>>,
    next_id: AtomicU32,
    ended: Mutex<Vec<mpsc::UnboundedSender<StreamId>>>,
}

impl SoftwareMixer {
    pub fn new(config: MixerConfig) -> Self {
        Self {
            config,
            streams: Mutex::new(BTreeMap::new()),
            next_id: AtomicU32::new(1),
            ended: Mutex::new(Vec::new()),
        }
    }

    /// Fill `out` with the saturating sum of every stream's next samples.
    ///
    /// Streams that ended and have nothing left are removed and reported to
    /// every [`subscribe_ended`](MixingGroup::subscribe_ended) receiver.
    /// Returns how many streams contributed at least one sample.
    pub fn mix_into(&self, out: &mut [i16]) -> usize {
        out.fill(0);
        let mut streams = lock(&self.streams);
        let mut contributors = 0;

        for stream in streams.values() {
            let mut buffer = lock(&stream.buffer);
            if buffer.is_empty() {
                continue;
            }
            contributors += 1;
            for slot in out.iter_mut() {
                match buffer.pop_front() {
                    Some(sample) => *slot = slot.saturating_add(sample),
                    None => break,
                }
            }
        }

        let drained: Vec<StreamId> = streams
            .iter()
            .filter(|(_, stream)| stream.is_drained())
            .map(|(id, _)| *id)
            .collect();
        for id in drained {
            if let Some(mut stream) = streams.remove(&id) {
                info!(stream = %id, remote = %stream.remote, "stream ended");
                stream.close();
                lock(&self.ended).retain(|subscriber| subscriber.send(id).is_ok());
            }
        }

        contributors
    }

    /// Whether a stream's connection has reached end of input.
    pub fn is_ended(&self, id: StreamId) -> Option<bool> {
        lock(&self.streams)
            .get(&id)
            .map(|stream| stream.finished.load(Ordering::SeqCst))
    }

    /// Samples currently buffered for a stream.
    pub fn buffered(&self, id: StreamId) -> Option<usize> {
        lock(&self.streams)
            .get(&id)
            .map(|stream| lock(&stream.buffer).len())
    }
}

impl Default for SoftwareMixer {
    fn default() -> Self {
        Self::new(MixerConfig::default())
    }
}

impl MixingGroup for SoftwareMixer {
    fn join(&self, mut stream: AudioStream) -> Result<StreamId, AudioError> {
        if !stream.mode().receives() {
            return Err(AudioError::UnsupportedMode(stream.mode()));
        }
        let source = stream.take_source().ok_or(AudioError::NoSource)?;
        let control = source.try_clone()?;

        let id = StreamId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let buffer: SampleBuffer = Arc::new(Mutex::new(VecDeque::new()));
        let finished = Arc::new(AtomicBool::new(false));

        let reader = {
            let buffer = Arc::clone(&buffer);
            let finished = Arc::clone(&finished);
            let max = self.config.max_buffered_samples;
            std::thread::Builder::new()
                .name(format!("mixer-{}", id.0))
                .spawn(move || read_pcm(source, &buffer, &finished, max, id))?
        };

        let remote = stream.remote();
        lock(&self.streams).insert(
            id,
            MixerStream {
                remote,
                buffer,
                finished,
                control,
                reader: Some(reader),
            },
        );
        info!(stream = %id, remote = %remote, mode = ?stream.mode(), "joined mixing group");
        Ok(id)
    }

    fn leave(&self, id: StreamId) -> Result<(), AudioError> {
        let mut stream = lock(&self.streams)
            .remove(&id)
            .ok_or(AudioError::UnknownStream(id))?;
        stream.close();
        info!(stream = %id, remote = %stream.remote, "left mixing group");
        Ok(())
    }

    fn stream_count(&self) -> usize {
        lock(&self.streams).len()
    }

    fn subscribe_ended(&self) -> mpsc::UnboundedReceiver<StreamId> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.ended).push(tx);
        rx
    }
}

impl Drop for SoftwareMixer {
    fn drop(&mut self) {
        let streams = std::mem::take(&mut *lock(&self.streams));
        for (_, mut stream) in streams {
            stream.close();
        }
    }
}

fn read_pcm(
    mut source: TcpStream,
    buffer: &Mutex<VecDeque<i16>>,
    finished: &AtomicBool,
    max: usize,
    id: StreamId,
) {
    let mut chunk = [0u8; READ_CHUNK];
    let mut carry: Option<u8> = None;

    loop {
        let n = match source.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!(stream = %id, error = %e, "stream read ended");
                break;
            }
        };

        let mut bytes = &chunk[..n];
        let mut samples = Vec::with_capacity(n / 2 + 1);
        if let Some(low) = carry.take() {
            if let Some((&high, rest)) = bytes.split_first() {
                samples.push(i16::from_le_bytes([low, high]));
                bytes = rest;
            }
        }
        let mut pairs = bytes.chunks_exact(2);
        for pair in &mut pairs {
            samples.push(i16::from_le_bytes([pair[0], pair[1]]));
        }
        carry = pairs.remainder().first().copied();

        let mut buffer = lock(buffer);
        buffer.extend(samples);
        let overflow = buffer.len().saturating_sub(max);
        if overflow > 0 {
            buffer.drain(..overflow);
        }
    }

    finished.store(true, Ordering::SeqCst);
    debug!(stream = %id, "stream reader finished");
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
