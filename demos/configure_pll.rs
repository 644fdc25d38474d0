//! Plan and program the FPGA PLL.
//!
//! Prints the divider plan for a set of clocks, then programs it into the
//! simulated board and reads the counters back.
//!
//! Run with:
//! ```bash
//! cargo run --example configure_pll -- 61.44e6 122.88e6
//! ```

use lms_driver::clock::{plan, FpgaPllClock, DIRECT_CLOCK_LIMIT_HZ};
use lms_driver::fpga::reg;
use lms_driver::mock::MockBoard;
use lms_driver::{ControlPort, DriverConfig, LmsDevice};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = DriverConfig::load()?;
    lms_driver::logging::init_from_config(&config)?;

    let requested: Vec<f64> = std::env::args()
        .skip(1)
        .map(|arg| arg.parse::<f64>())
        .collect::<Result<_, _>>()?;
    let requested = if requested.is_empty() {
        vec![61.44e6, 122.88e6]
    } else {
        requested
    };
    let mut clocks: Vec<FpgaPllClock> = requested
        .iter()
        .enumerate()
        .map(|(i, &hz)| FpgaPllClock::new(i as u8, hz).with_phase(if i == 0 { 0.0 } else { 90.0 }))
        .collect();

    let reference = config.pll.reference_hz;
    let pll_clocks: Vec<FpgaPllClock> = clocks
        .iter()
        .filter(|c| c.out_frequency >= DIRECT_CLOCK_LIMIT_HZ)
        .copied()
        .collect();
    if !pll_clocks.is_empty() {
        let plan = plan(reference, &pll_clocks)?;
        println!(
            "Reference {:.3} MHz -> VCO {:.3} MHz (M={}, N={})",
            reference / 1e6,
            plan.vco_hz / 1e6,
            plan.m,
            plan.n
        );
        for counter in &plan.counters {
            println!(
                "  C{}: /{} -> {:.6} MHz, {} phase steps",
                counter.index,
                counter.divider,
                counter.achieved_hz / 1e6,
                counter.phase_steps
            );
        }
    }

    let board = MockBoard::new();
    let device = LmsDevice::from_connection(board.connection(), &config)?;
    let achieved = device.configure_fpga_pll(0, &mut clocks)?;
    for (clock, hz) in clocks.iter().zip(&achieved) {
        println!(
            "clock {}: requested {:.6} MHz, achieved {:.6} MHz",
            clock.index,
            clock.out_frequency / 1e6,
            hz / 1e6
        );
    }

    let control = device.control();
    let readback = control.read_registers(&[
        reg::PLL_NM_FLAGS,
        reg::PLL_C_FLAGS_LO,
        reg::PLL_C_FLAGS_HI,
        reg::PLL_N_COUNT,
        reg::PLL_M_COUNT,
    ])?;
    println!("NM flags, C flags, N, M: {readback:04X?}");
    device.close();
    Ok(())
}
