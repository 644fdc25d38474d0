//! Stream samples from the simulated board.
//!
//! Opens a `MockBoard`, receives a few thousand samples on RX channel 0,
//! transmits one timed burst on TX channel 0, then prints the stream
//! counters.
//!
//! Run with:
//! ```bash
//! cargo run --example mock_stream
//! ```

use std::time::Duration;

use lms_driver::mock::MockBoard;
use lms_driver::{Direction, DriverConfig, LmsDevice, StreamMetadata};
use num_complex::Complex;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = DriverConfig::default();
    lms_driver::logging::init_from_config(&config)?;

    let board = MockBoard::new();
    let device = LmsDevice::from_connection(board.connection(), &config)?;
    println!("Opened {}", device.handle());
    println!("{:#?}", device.info()?);

    let rx = device.setup_stream(device.stream_config(Direction::Rx).channel(0).build()?)?;
    rx.start()?;

    let mut samples = vec![Complex::<i16>::default(); 4096];
    let mut meta = StreamMetadata::default();
    for _ in 0..4 {
        let n = rx.recv(&mut samples, &mut meta, Duration::from_secs(1))?;
        let peak = samples[..n].iter().map(|s| s.re.abs()).max().unwrap_or(0);
        println!("RX {n} samples @ {} (peak I {peak})", meta.timestamp);
    }

    // Schedule a burst 50k samples ahead of the board clock.
    let tx = device.setup_stream(device.stream_config(Direction::Tx).channel(0).build()?)?;
    tx.start()?;
    let when = device.hardware_timestamp() + 50_000;
    let tone: Vec<Complex<i16>> = (0..2040)
        .map(|n| {
            let phase = n as f32 * std::f32::consts::TAU / 32.0;
            Complex::new((phase.cos() * 1500.0) as i16, (phase.sin() * 1500.0) as i16)
        })
        .collect();
    let queued = tx.send(&tone, &StreamMetadata::at(when).with_end_of_burst(), Duration::from_secs(1))?;
    let completion = tx.read_completion(Duration::from_secs(1))?;
    println!("TX queued {queued} samples for {when}, completion {completion:?}");

    println!("RX status: {:?}", rx.status());
    println!("TX status: {:?}", tx.status());

    tx.close()?;
    rx.close()?;
    device.close();
    println!("Board captured {} TX packets", board.tx_packet_count());
    Ok(())
}
