//! Dedicated decode thread fed by a bounded channel

use std::thread::JoinHandle;

use bytes::Bytes;
use flume::{bounded, Receiver, Sender};
use tracing::{error, info};

use crate::decode::{CodecSelector, PooledFrame, VideoCodec};
use crate::error::DecodeError;

/// Runs one stream's decoder on its own thread
///
/// Encoded units go in through [`units`](DecodeWorker::units); decoded frames
/// come out of [`frames`](DecodeWorker::frames). A hard decode error closes
/// the decoder and ends the thread.
pub struct DecodeWorker {
    units: Sender<Bytes>,
    frames: Receiver<PooledFrame>,
    handle: JoinHandle<Result<u64, DecodeError>>,
}

impl DecodeWorker {
    pub fn spawn(codec: VideoCodec, pool_capacity: usize, queue_depth: usize) -> std::io::Result<Self> {
        let (units_tx, units_rx) = bounded::<Bytes>(queue_depth);
        // Never hold more frames than the pool can recycle
        let (frames_tx, frames_rx) = bounded::<PooledFrame>(pool_capacity.max(1));

        let handle = std::thread::Builder::new()
            .name(format!("decode-{}", codec).to_lowercase())
            .spawn(move || run(codec, pool_capacity, units_rx, frames_tx))?;

        Ok(Self {
            units: units_tx,
            frames: frames_rx,
            handle,
        })
    }

    pub fn units(&self) -> &Sender<Bytes> {
        &self.units
    }

    pub fn frames(&self) -> &Receiver<PooledFrame> {
        &self.frames
    }

    /// Stop accepting units, wait for the thread and return how many frames it decoded.
    pub fn finish(self) -> Result<u64, DecodeError> {
        drop(self.units);
        drop(self.frames);
        match self.handle.join() {
            Ok(result) => result,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
}

fn run(
    codec: VideoCodec,
    pool_capacity: usize,
    units: Receiver<Bytes>,
    frames: Sender<PooledFrame>,
) -> Result<u64, DecodeError> {
    let mut selector = CodecSelector::new(pool_capacity);
    selector.resolve(codec);

    let mut decoded = 0;
    for unit in units.iter() {
        match selector.decode(&unit) {
            Ok(Some(frame)) => {
                decoded += 1;
                if frames.send(frame).is_err() {
                    break;
                }
            }
            Ok(None) => {}
            Err(e) => {
                error!("Decode error, closing {} stream: {}", codec, e);
                selector.close();
                return Err(e);
            }
        }
    }

    selector.close();
    info!("Decode worker finished after {} frames", decoded);
    Ok(decoded)
}
