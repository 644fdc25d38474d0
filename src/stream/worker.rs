//! RX and TX streaming threads.
//!
//! Each loop re-reads the active stream list every iteration, so streams can
//! join or leave a running direction. Both exit when their stop flag is set
//! or the pipeline is poisoned.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use num_complex::Complex;
use tracing::{debug, trace, warn};

use super::fifo::{FifoError, SampleBlock};
use super::packet::{
    decode_packet, encode_packet, samples_per_packet, PacketFlags, PacketHeader,
    DATA_PACKET_SIZE,
};
use super::{
    Direction, PipelineShared, SampleFormat, StreamChannel, StreamMetadata, MAX_PACKETS_PER_TRANSFER,
};

fn running(shared: &PipelineShared, stop: &AtomicBool) -> bool {
    !stop.load(Ordering::SeqCst) && !shared.is_fatal()
}

fn flag_timeout(streams: &[Arc<StreamChannel>]) {
    for stream in streams {
        stream.pending_timeout.store(true, Ordering::SeqCst);
    }
}

/// Board-to-host loop: read packets, split channels, fill RX FIFOs.
pub(super) fn rx_loop(shared: Arc<PipelineShared>, stop: Arc<AtomicBool>) {
    let data = match shared.transport.data() {
        Ok(channel) => channel,
        Err(e) => {
            shared.mark_fatal(&e);
            return;
        }
    };
    debug!("RX thread running");

    let mut buf = vec![0u8; DATA_PACKET_SIZE * MAX_PACKETS_PER_TRANSFER];
    // Bytes of an incomplete packet carried into the next transfer.
    let mut filled = 0usize;
    let mut expected_counter: Option<u64> = None;

    while running(&shared, &stop) {
        let streams = shared.active(Direction::Rx);
        let Some(first) = streams.first() else {
            filled = 0;
            expected_counter = None;
            thread::sleep(shared.settings.idle_wait);
            continue;
        };
        let link = first.config.format.link_format();
        let want = first.config.packets_per_transfer() * DATA_PACKET_SIZE;

        let read = match data.read(&mut buf[filled..want], shared.settings.transfer_timeout) {
            Ok(n) => n,
            Err(e) if e.is_fatal() => {
                shared.mark_fatal(&e);
                break;
            }
            Err(e) => {
                warn!(error = %e, "RX transfer failed");
                flag_timeout(&streams);
                continue;
            }
        };
        if read == 0 {
            trace!("RX transfer timed out with no data");
            flag_timeout(&streams);
            continue;
        }
        filled += read;

        let complete = filled / DATA_PACKET_SIZE;
        for packet in buf[..complete * DATA_PACKET_SIZE].chunks_exact(DATA_PACKET_SIZE) {
            deliver_rx_packet(&shared, &streams, packet, link, &mut expected_counter);
        }
        let consumed = complete * DATA_PACKET_SIZE;
        buf.copy_within(consumed..filled, 0);
        filled -= consumed;
    }
    debug!("RX thread exiting");
}

fn deliver_rx_packet(
    shared: &PipelineShared,
    streams: &[Arc<StreamChannel>],
    packet: &[u8],
    link: SampleFormat,
    expected_counter: &mut Option<u64>,
) {
    let (header, channels) = match decode_packet(packet, link, streams.len()) {
        Ok(decoded) => decoded,
        Err(e) => {
            warn!(error = %e, "Discarding malformed RX packet");
            return;
        }
    };
    let per_channel = channels.first().map_or(0, Vec::len) as u64;
    let end = header.counter + per_channel;

    let gap = expected_counter.is_some_and(|expected| expected != header.counter);
    if gap {
        debug!(
            expected = expected_counter.unwrap_or_default(),
            received = header.counter,
            "RX packet counter discontinuity"
        );
    }
    *expected_counter = Some(end);
    shared.hw_timestamp.fetch_max(end, Ordering::SeqCst);

    if header.flags.contains(PacketFlags::TX_DROPPED_LATE) {
        for tx in shared.active(Direction::Tx) {
            tx.late.fetch_add(1, Ordering::Relaxed);
        }
    }

    let share = DATA_PACKET_SIZE / streams.len().max(1);
    for (stream, samples) in streams.iter().zip(channels) {
        stream.account_bytes(share);
        if gap {
            stream.dropped_packets.fetch_add(1, Ordering::Relaxed);
            stream.pending_dropped.store(true, Ordering::SeqCst);
        }
        let mut block = SampleBlock::new(header.counter, samples);
        if let Some(target) = *stream.sync_target.lock() {
            if end <= target {
                continue;
            }
            if header.counter < target {
                let skip = (target - header.counter) as usize;
                block = SampleBlock::new(target, block.samples.split_off(skip));
            }
        }
        block.meta.dropped = stream.pending_dropped.swap(false, Ordering::SeqCst);
        match stream.fifo.push(block, shared.settings.fifo_timeout) {
            Ok(()) => {}
            Err(FifoError::Timeout) => {
                stream.overruns.fetch_add(1, Ordering::Relaxed);
                stream.pending_dropped.store(true, Ordering::SeqCst);
                trace!(channel = stream.config.channel, "RX FIFO full, block dropped");
            }
            Err(FifoError::Closed) => {}
        }
    }
}

/// Host-to-board loop: drain TX FIFOs into packets and write them.
pub(super) fn tx_loop(shared: Arc<PipelineShared>, stop: Arc<AtomicBool>) {
    let data = match shared.transport.data() {
        Ok(channel) => channel,
        Err(e) => {
            shared.mark_fatal(&e);
            return;
        }
    };
    debug!("TX thread running");

    let mut out = Vec::with_capacity(DATA_PACKET_SIZE * MAX_PACKETS_PER_TRANSFER);
    let mut completions: Vec<(Arc<StreamChannel>, StreamMetadata)> = Vec::new();

    while running(&shared, &stop) {
        let streams = shared.active(Direction::Tx);
        let Some(first) = streams.first() else {
            thread::sleep(shared.settings.idle_wait);
            continue;
        };
        let link = first.config.format.link_format();
        let per_channel = samples_per_packet(link, streams.len());
        let batch = first.config.packets_per_transfer();

        out.clear();
        completions.clear();
        for index in 0..batch {
            let wait = if index == 0 {
                shared.settings.idle_wait
            } else {
                Duration::ZERO
            };
            let Some(blocks) = gather(&shared, &streams, per_channel, wait) else {
                break;
            };
            let meta = blocks[0].meta;

            if meta.sync && meta.timestamp < shared.hw_timestamp.load(Ordering::SeqCst) {
                debug!(
                    timestamp = meta.timestamp,
                    now = shared.hw_timestamp.load(Ordering::SeqCst),
                    "Dropping late TX block"
                );
                for (stream, block) in streams.iter().zip(&blocks) {
                    stream.late.fetch_add(1, Ordering::Relaxed);
                    stream.complete(StreamMetadata {
                        late: true,
                        ..block.meta
                    });
                }
                continue;
            }

            let mut flags = PacketFlags::empty();
            if !meta.sync {
                flags |= PacketFlags::IGNORE_TIMESTAMP;
            }
            if meta.end_of_burst {
                flags |= PacketFlags::END_OF_BURST;
            }
            let slices: Vec<&[Complex<i16>]> = blocks.iter().map(|b| b.samples.as_slice()).collect();
            let header = PacketHeader {
                flags,
                counter: meta.timestamp,
            };
            if let Err(e) = encode_packet(header, link, &slices, &mut out) {
                warn!(error = %e, "Cannot encode TX packet");
                continue;
            }
            for (stream, block) in streams.iter().zip(&blocks) {
                completions.push((Arc::clone(stream), block.meta));
            }
        }
        if out.is_empty() {
            continue;
        }

        match data.write(&out, shared.settings.transfer_timeout) {
            Ok(written) if written == out.len() => {
                let share = DATA_PACKET_SIZE / streams.len();
                for (stream, meta) in completions.drain(..) {
                    stream.account_bytes(share);
                    stream.complete(meta);
                }
            }
            Ok(written) => {
                warn!(written, expected = out.len(), "TX transfer timed out");
                flag_timeout(&streams);
            }
            Err(e) if e.is_fatal() => {
                shared.mark_fatal(&e);
                break;
            }
            Err(e) => {
                warn!(error = %e, "TX transfer failed");
                flag_timeout(&streams);
            }
        }
    }
    debug!("TX thread exiting");
}

/// One block per active TX stream, aligned to the first stream's length.
///
/// Returns `None` when the first stream has nothing queued. A lagging
/// secondary stream is padded with silence and counted as an underrun.
fn gather(
    shared: &PipelineShared,
    streams: &[Arc<StreamChannel>],
    per_channel: usize,
    wait: Duration,
) -> Option<Vec<SampleBlock>> {
    let lead = streams.first()?.fifo.pop_samples(per_channel, wait).ok()?;
    let len = lead.len();
    let timestamp = lead.meta.timestamp;
    let mut blocks = Vec::with_capacity(streams.len());
    blocks.push(lead);
    for stream in &streams[1..] {
        match stream.fifo.pop_samples(len, shared.settings.fifo_timeout) {
            Ok(block) => blocks.push(block),
            Err(_) => {
                stream.underruns.fetch_add(1, Ordering::Relaxed);
                blocks.push(SampleBlock::new(timestamp, vec![Complex::default(); len]));
            }
        }
    }
    Some(blocks)
}
