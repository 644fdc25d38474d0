//! Streaming tests against the simulated board.
//!
//! Every test opens its own `MockBoard`, so they run in parallel.

use std::thread;
use std::time::{Duration, Instant};

use lms_driver::fpga::reg;
use lms_driver::mock::{ramp_sample, MockBoard};
use lms_driver::stream::packet::{decode_packet, PacketFlags};
use lms_driver::{
    Direction, DriverConfig, ErrorKind, LmsDevice, SampleFormat, StreamConfig, StreamMetadata,
};
use num_complex::Complex;
use tracing_test::traced_test;

fn open(board: &MockBoard) -> LmsDevice {
    LmsDevice::from_connection(board.connection(), &DriverConfig::default()).unwrap()
}

fn rx_config(channel: usize) -> StreamConfig {
    StreamConfig::builder()
        .direction(Direction::Rx)
        .channel(channel)
        .build()
        .unwrap()
}

fn tx_config(channel: usize) -> StreamConfig {
    StreamConfig::builder()
        .direction(Direction::Tx)
        .channel(channel)
        .build()
        .unwrap()
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    condition()
}

#[test]
#[traced_test]
fn test_rx_delivers_contiguous_samples_from_timestamp_zero() {
    let board = MockBoard::new();
    let device = open(&board);
    let stream = device.setup_stream(rx_config(0)).unwrap();
    stream.start().unwrap();

    assert_eq!(board.fpga_register(reg::STREAM_CTRL) & reg::STREAM_EN, reg::STREAM_EN);
    assert_eq!(board.fpga_register(reg::CHANNEL_ENABLE), 0b01);
    assert_eq!(board.fpga_register(reg::SAMPLE_WIDTH), reg::WIDTH_I16);

    let mut samples = vec![Complex::<i16>::default(); 3000];
    let mut meta = StreamMetadata::default();
    let n = stream.recv(&mut samples, &mut meta, Duration::from_secs(2)).unwrap();
    assert_eq!(n, 3000);
    assert_eq!(meta.timestamp, 0);
    for (i, sample) in samples.iter().enumerate() {
        assert_eq!(*sample, ramp_sample(i as u64, 0), "sample {i}");
    }
    assert!(device.hardware_timestamp() >= 3000);

    stream.close().unwrap();
    assert_eq!(board.fpga_register(reg::STREAM_CTRL) & reg::STREAM_EN, 0);
}

#[test]
fn test_rx_packed_link_and_float_host_buffers() {
    let board = MockBoard::new();
    let device = open(&board);

    let packed = device
        .setup_stream(
            StreamConfig::builder()
                .format(SampleFormat::Packed12)
                .build()
                .unwrap(),
        )
        .unwrap();
    packed.start().unwrap();
    assert_eq!(board.fpga_register(reg::SAMPLE_WIDTH), reg::WIDTH_PACKED12);

    let mut samples = vec![Complex::<i16>::default(); 2000];
    let mut meta = StreamMetadata::default();
    packed.recv(&mut samples, &mut meta, Duration::from_secs(2)).unwrap();
    assert_eq!(samples[1500], ramp_sample(meta.timestamp + 1500, 0));
    packed.close().unwrap();

    let float = device
        .setup_stream(
            StreamConfig::builder()
                .format(SampleFormat::Float32)
                .build()
                .unwrap(),
        )
        .unwrap();
    float.start().unwrap();
    assert_eq!(board.fpga_register(reg::SAMPLE_WIDTH), reg::WIDTH_I16);
    let mut floats = vec![Complex::<f32>::default(); 100];
    let mut meta = StreamMetadata::default();
    float.recv(&mut floats, &mut meta, Duration::from_secs(2)).unwrap();
    let expected = ramp_sample(meta.timestamp + 10, 0);
    assert_eq!(floats[10].re, f32::from(expected.re) / 2048.0);
    assert_eq!(floats[10].im, f32::from(expected.im) / 2048.0);
}

#[test]
fn test_rx_sync_discards_samples_before_target() {
    let board = MockBoard::new();
    let device = open(&board);
    let stream = device.setup_stream(rx_config(0)).unwrap();
    stream.start().unwrap();

    let target = board.rx_counter() + 20_000;
    let mut samples = vec![Complex::<i16>::default(); 100];
    let mut meta = StreamMetadata::at(target);
    stream.recv(&mut samples, &mut meta, Duration::from_secs(2)).unwrap();
    assert_eq!(meta.timestamp, target);
    assert_eq!(samples[0], ramp_sample(target, 0));
}

#[test]
fn test_two_rx_channels_share_packets() {
    let board = MockBoard::new();
    let device = open(&board);
    let first = device.setup_stream(rx_config(0)).unwrap();
    let second = device.setup_stream(rx_config(1)).unwrap();
    first.start().unwrap();
    second.start().unwrap();
    assert_eq!(board.fpga_register(reg::CHANNEL_ENABLE), 0b11);

    let target = board.rx_counter() + 20_000;
    let mut samples = vec![Complex::<i16>::default(); 600];
    let mut meta = StreamMetadata::at(target);
    second.recv(&mut samples, &mut meta, Duration::from_secs(2)).unwrap();
    assert_eq!(meta.timestamp, target);
    for (i, sample) in samples.iter().enumerate() {
        assert_eq!(*sample, ramp_sample(target + i as u64, 1), "sample {i}");
    }

    // Stopping one channel keeps the other streaming.
    second.stop().unwrap();
    assert_eq!(board.fpga_register(reg::CHANNEL_ENABLE), 0b01);
    assert_eq!(board.fpga_register(reg::STREAM_CTRL) & reg::STREAM_EN, reg::STREAM_EN);
}

#[test]
fn test_rx_streams_must_share_link_format() {
    let board = MockBoard::new();
    let device = open(&board);
    let first = device.setup_stream(rx_config(0)).unwrap();
    first.start().unwrap();
    let packed = device
        .setup_stream(
            StreamConfig::builder()
                .channel(1)
                .format(SampleFormat::Packed12)
                .build()
                .unwrap(),
        )
        .unwrap();
    assert_eq!(packed.start().unwrap_err().kind(), ErrorKind::InvalidArgument);
}

#[test]
fn test_counter_gap_counts_dropped_packets() {
    let board = MockBoard::new();
    let device = open(&board);
    let stream = device.setup_stream(rx_config(0)).unwrap();
    stream.start().unwrap();

    let mut samples = vec![Complex::<i16>::default(); 1000];
    let mut meta = StreamMetadata::default();
    stream.recv(&mut samples, &mut meta, Duration::from_secs(2)).unwrap();
    assert_eq!(stream.status().dropped_packets, 0);

    board.skip_rx_packets(3);
    assert!(wait_until(Duration::from_secs(2), || stream.status().dropped_packets >= 1));
}

#[test]
fn test_full_rx_fifo_counts_overruns() {
    let board = MockBoard::new();
    let device = open(&board);
    let stream = device
        .setup_stream(
            StreamConfig::builder()
                .buffer_depth(2)
                .build()
                .unwrap(),
        )
        .unwrap();
    stream.start().unwrap();

    assert!(wait_until(Duration::from_secs(2), || stream.status().overruns >= 1));
    let status = stream.status();
    assert_eq!(status.fifo_size, 2);
    assert!(status.fifo_filled <= 2);
}

#[test]
fn test_tx_packets_reach_the_board() {
    let board = MockBoard::new();
    let device = open(&board);
    let stream = device.setup_stream(tx_config(0)).unwrap();
    stream.start().unwrap();
    assert_eq!(
        board.fpga_register(reg::STREAM_CTRL) & (reg::STREAM_EN | reg::TX_EN),
        reg::STREAM_EN | reg::TX_EN
    );

    let sent: Vec<Complex<i16>> = (0..2040)
        .map(|n| Complex::new((n % 2000) as i16 - 1000, 7))
        .collect();
    let meta = StreamMetadata {
        end_of_burst: true,
        ..StreamMetadata::default()
    };
    assert_eq!(stream.send(&sent, &meta, Duration::from_secs(1)).unwrap(), 2040);
    let completion = stream.read_completion(Duration::from_secs(2)).unwrap();
    assert!(!completion.late);

    assert!(wait_until(Duration::from_secs(2), || board.tx_packet_count() >= 2));
    let packets = board.take_tx_packets();
    let (first, first_samples) = decode_packet(&packets[0], SampleFormat::I12In16, 1).unwrap();
    let (second, second_samples) = decode_packet(&packets[1], SampleFormat::I12In16, 1).unwrap();

    assert!(first.flags.contains(PacketFlags::IGNORE_TIMESTAMP));
    assert!(!first.flags.contains(PacketFlags::END_OF_BURST));
    assert!(second.flags.contains(PacketFlags::END_OF_BURST));
    assert_eq!(first_samples[0], sent[..1020]);
    assert_eq!(second_samples[0], sent[1020..]);
}

#[test]
fn test_late_tx_block_is_dropped_and_reported() {
    let board = MockBoard::new();
    let device = open(&board);
    let rx = device.setup_stream(rx_config(0)).unwrap();
    rx.start().unwrap();
    let mut samples = vec![Complex::<i16>::default(); 3000];
    let mut meta = StreamMetadata::default();
    rx.recv(&mut samples, &mut meta, Duration::from_secs(2)).unwrap();
    assert!(device.hardware_timestamp() >= 3000);

    let tx = device.setup_stream(tx_config(0)).unwrap();
    tx.start().unwrap();
    let burst = vec![Complex::new(1i16, 1i16); 1020];
    tx.send(&burst, &StreamMetadata::at(0), Duration::from_secs(1)).unwrap();

    let completion = tx.read_completion(Duration::from_secs(2)).unwrap();
    assert!(completion.late);
    assert!(tx.status().late >= 1);
    assert_eq!(board.tx_packet_count(), 0);
}

#[test]
fn test_fatal_transport_error_poisons_pipeline() {
    let board = MockBoard::new();
    let device = open(&board);
    let stream = device.setup_stream(rx_config(0)).unwrap();
    stream.start().unwrap();

    let mut samples = vec![Complex::<i16>::default(); 100];
    let mut meta = StreamMetadata::default();
    stream.recv(&mut samples, &mut meta, Duration::from_secs(2)).unwrap();

    board.trigger_data_failure();
    let deadline = Instant::now() + Duration::from_secs(2);
    let err = loop {
        match stream.recv(&mut samples, &mut meta, Duration::from_millis(20)) {
            Err(e) if e.is_fatal() => break e,
            _ if Instant::now() > deadline => panic!("pipeline was not poisoned"),
            _ => {}
        }
    };
    assert_eq!(err.kind(), ErrorKind::TransportFatal);

    // No more data-channel traffic once poisoned.
    let reads = board.data_reads();
    thread::sleep(Duration::from_millis(50));
    assert_eq!(board.data_reads(), reads);

    // Later calls fail the same way.
    assert!(stream.start().unwrap_err().is_fatal());
    assert!(device.setup_stream(tx_config(1)).unwrap_err().is_fatal());
    stream.close().unwrap();
}

#[test]
fn test_bad_channel_rejected_without_transport_io() {
    let board = MockBoard::new();
    let device = open(&board);
    let before = board.control_transfers();

    let err = device.setup_stream(rx_config(2)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    assert_eq!(board.control_transfers(), before);
    assert_eq!(board.data_reads(), 0);
    assert!(!board.is_data_open());
}

#[test]
fn test_duplicate_stream_is_busy() {
    let board = MockBoard::new();
    let device = open(&board);
    let _first = device.setup_stream(rx_config(0)).unwrap();
    let err = device.setup_stream(rx_config(0)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Busy);
    // The same channel in the other direction is independent.
    assert!(device.setup_stream(tx_config(0)).is_ok());
}

#[test]
fn test_buffer_type_and_direction_checked() {
    let board = MockBoard::new();
    let device = open(&board);
    let rx = device.setup_stream(rx_config(0)).unwrap();
    rx.start().unwrap();

    let mut floats = vec![Complex::<f32>::default(); 10];
    let mut meta = StreamMetadata::default();
    let err = rx.recv(&mut floats, &mut meta, Duration::from_millis(10)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);

    let err = rx
        .send(&[Complex::<i16>::default()], &meta, Duration::from_millis(10))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
}

#[test]
fn test_device_close_stops_threads_and_closes_transport() {
    let board = MockBoard::new();
    let device = open(&board);
    let rx = device.setup_stream(rx_config(0)).unwrap();
    let tx = device.setup_stream(tx_config(1)).unwrap();
    rx.start().unwrap();
    tx.start().unwrap();
    assert!(board.is_data_open());

    device.close();
    assert!(!board.is_data_open());
    assert!(!board.is_control_open());
    assert_eq!(board.fpga_register(reg::STREAM_CTRL) & reg::STREAM_EN, 0);

    let reads = board.data_reads();
    thread::sleep(Duration::from_millis(30));
    assert_eq!(board.data_reads(), reads);
    drop(rx);
    drop(tx);
}

#[test]
fn test_streams_outliving_their_device_do_not_reopen_the_link() {
    let board = MockBoard::new();
    let device = open(&board);
    let rx = device.setup_stream(rx_config(0)).unwrap();
    let tx = device.setup_stream(tx_config(0)).unwrap();
    device.close();
    let transfers = board.control_transfers();

    let err = rx.start().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotConnected);
    assert!(!board.is_data_open());

    let mut samples = vec![Complex::<i16>::default(); 16];
    let err = rx
        .recv(&mut samples, &mut StreamMetadata::default(), Duration::from_millis(10))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotConnected);
    let err = tx
        .send(&samples, &StreamMetadata::default(), Duration::from_millis(10))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotConnected);

    assert!(!board.is_data_open());
    assert_eq!(board.control_transfers(), transfers);
    rx.close().unwrap();
    tx.close().unwrap();
}

#[test]
fn test_send_near_timestamp_wrap_queues_every_block() {
    let board = MockBoard::new();
    let device = open(&board);
    let tx = device.setup_stream(tx_config(0)).unwrap();

    let samples = vec![Complex::<i16>::new(1, -1); 2040];
    let meta = StreamMetadata {
        timestamp: u64::MAX - 5,
        ..StreamMetadata::default()
    };
    let queued = tx.send(&samples, &meta, Duration::from_millis(50)).unwrap();
    assert_eq!(queued, 2040);
    assert_eq!(tx.status().fifo_filled, 2);
    tx.close().unwrap();
}
