//! FPGA PLL clock synthesis.
//!
//! Outputs below [`DIRECT_CLOCK_LIMIT_HZ`] bypass the PLL: the reference is
//! routed straight through and a phase-interpolator tap provides the shift.
//! Everything else is synthesized by the PLL:
//!
//! ```text
//! reference ──► ÷N ──► PFD ──► VCO (600..1300 MHz) ──┬──► ÷C0 ──► clock 0
//!                       ▲                            ├──► ÷C1 ──► clock 1
//!                       └──────────── ÷M ◄───────────┘    ...
//! ```
//!
//! [`plan`] is a pure function from the request to divider values, so the
//! same inputs always program the same registers. [`ClockSynthesizer`] then
//! issues the register sequence, polling the PLL status under a bounded
//! budget after each start strobe.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, instrument};

use crate::error::{LmsError, Result, ResultExt};
use crate::fpga::reg;
use crate::poll::{system_clock, BoundedPoll, PollStep, SharedClock};
use crate::protocol::ControlPort;

/// Outputs below this frequency use direct clocking.
pub const DIRECT_CLOCK_LIMIT_HZ: f64 = 5e6;
/// Lowest valid VCO frequency.
pub const VCO_MIN_HZ: f64 = 600e6;
/// Highest valid VCO frequency.
pub const VCO_MAX_HZ: f64 = 1300e6;
/// Largest N and M divider.
pub const MAX_NM_DIVIDER: u32 = 255;
/// Largest output (C) divider.
pub const MAX_C_DIVIDER: u32 = 510;
/// Number of output counters.
pub const MAX_CLOCKS: u8 = 16;

// Phase-interpolator step is 360° of the input clock per this many hertz.
const INTERPOLATOR_HZ: f64 = 100e6;
// The phase shifter moves in 1/8 of a VCO period.
const PHASE_STEPS_PER_VCO_PERIOD: f64 = 8.0;

/// One requested FPGA clock and, after programming, its achieved frequency.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FpgaPllClock {
    /// Requested output frequency in Hz.
    pub out_frequency: f64,
    /// Requested phase shift in degrees.
    pub phase_shift_deg: f64,
    /// Output counter index.
    pub index: u8,
    /// Route the VCO straight to this output.
    pub bypass: bool,
    /// Frequency actually produced. Valid after programming.
    pub achieved_frequency: f64,
}

impl FpgaPllClock {
    /// Clock `index` at `out_frequency` Hz with no phase shift.
    pub fn new(index: u8, out_frequency: f64) -> Self {
        Self {
            out_frequency,
            phase_shift_deg: 0.0,
            index,
            bypass: false,
            achieved_frequency: 0.0,
        }
    }

    /// Set the phase shift.
    pub fn with_phase(mut self, degrees: f64) -> Self {
        self.phase_shift_deg = degrees;
        self
    }

    /// Bypass the output counter.
    pub fn with_bypass(mut self, bypass: bool) -> Self {
        self.bypass = bypass;
        self
    }

    fn is_direct(&self) -> bool {
        self.out_frequency < DIRECT_CLOCK_LIMIT_HZ
    }
}

/// High/low counts and mode bits of one PLL counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CounterFields {
    /// Low count.
    pub low: u8,
    /// High count.
    pub high: u8,
    /// Counter bypassed (divide by one).
    pub bypass: bool,
    /// Odd division: high count is one more than low.
    pub odd: bool,
}

impl CounterFields {
    /// Fields for dividing by `divider`.
    pub fn for_divider(divider: u32) -> Self {
        let divider = divider.clamp(1, MAX_C_DIVIDER);
        let odd = divider % 2 == 1;
        let low = divider / 2;
        let high = low + u32::from(odd);
        Self {
            low: u8::try_from(low).unwrap_or(u8::MAX),
            high: u8::try_from(high).unwrap_or(u8::MAX),
            bypass: divider == 1,
            odd,
        }
    }

    /// Division ratio these fields encode.
    pub fn divider(self) -> u32 {
        if self.bypass {
            1
        } else {
            u32::from(self.low) + u32::from(self.high)
        }
    }

    /// Count register value: high count in the upper byte.
    pub fn register(self) -> u16 {
        u16::from(self.high) << 8 | u16::from(self.low)
    }

    /// Inverse of [`Self::register`] plus the flag bits.
    pub fn from_register(value: u16, bypass: bool, odd: bool) -> Self {
        Self {
            low: value as u8,
            high: (value >> 8) as u8,
            bypass,
            odd,
        }
    }

    fn flag_bits(self) -> u16 {
        u16::from(self.bypass) | u16::from(self.odd) << 1
    }
}

/// Divider and phase chosen for one output.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CounterPlan {
    /// Output counter index.
    pub index: u8,
    /// C divider.
    pub divider: u32,
    /// Output bypassed.
    pub bypass: bool,
    /// VCO frequency divided by `divider`.
    pub achieved_hz: f64,
    /// Signed phase-shifter step count.
    pub phase_steps: i32,
}

/// Complete PLL configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct PllPlan {
    /// Feedback multiplier.
    pub m: u32,
    /// Reference divider.
    pub n: u32,
    /// `reference × M / N`.
    pub vco_hz: f64,
    /// One entry per requested output, in request order.
    pub counters: Vec<CounterPlan>,
}

impl PllPlan {
    /// Register writes for the N, M and C counters.
    ///
    /// Counters not in the plan are left bypassed.
    pub fn counter_writes(&self) -> Vec<(u16, u16)> {
        let n = CounterFields::for_divider(self.n);
        let m = CounterFields::for_divider(self.m);
        let mut c_flags: u32 = 0x5555_5555;
        for counter in &self.counters {
            let fields = CounterFields::for_divider(counter.divider);
            let shift = 2 * u32::from(counter.index);
            c_flags = (c_flags & !(0b11 << shift)) | (u32::from(fields.flag_bits()) << shift);
        }

        let mut writes = vec![
            (reg::PLL_NM_FLAGS, n.flag_bits() | m.flag_bits() << 2),
            (reg::PLL_C_FLAGS_LO, c_flags as u16),
            (reg::PLL_C_FLAGS_HI, (c_flags >> 16) as u16),
            (reg::PLL_N_COUNT, n.register()),
            (reg::PLL_M_COUNT, m.register()),
        ];
        writes.extend(self.counters.iter().map(|c| {
            (
                reg::PLL_C_COUNT_BASE + u16::from(c.index),
                CounterFields::for_divider(c.divider).register(),
            )
        }));
        writes
    }
}

fn in_vco_window(hz: f64) -> bool {
    (VCO_MIN_HZ..=VCO_MAX_HZ).contains(&hz)
}

fn divides_exactly(vco: f64, clock: &FpgaPllClock) -> bool {
    if clock.bypass {
        return (vco - clock.out_frequency).abs() <= vco * 1e-9;
    }
    let ratio = vco / clock.out_frequency;
    (ratio - ratio.round()).abs() < 1e-6
}

/// Best `(M, N, deviation)` realizing `vco` from `reference`.
///
/// Ties on deviation keep the smallest N.
fn search_mn(reference: f64, vco: f64) -> Option<(u32, u32, f64)> {
    let mut best: Option<(u32, u32, f64)> = None;
    for n in 1..=MAX_NM_DIVIDER {
        let m = (vco * f64::from(n) / reference).round();
        if m < 1.0 || m > f64::from(MAX_NM_DIVIDER) {
            continue;
        }
        let m = m as u32;
        let achieved = reference * f64::from(m) / f64::from(n);
        if !in_vco_window(achieved) {
            continue;
        }
        let deviation = (vco - achieved).abs();
        if best.map_or(true, |(_, _, d)| deviation < d) {
            best = Some((m, n, deviation));
        }
    }
    best
}

/// Steps of 1/8 VCO period for `degrees` of an output at `out_hz`.
fn phase_steps(degrees: f64, out_hz: f64, vco_hz: f64) -> Result<i32> {
    let step_deg = 360.0 * out_hz / (PHASE_STEPS_PER_VCO_PERIOD * vco_hz);
    let steps = (degrees / step_deg).round();
    if !steps.is_finite() || steps.abs() > f64::from(u16::MAX) {
        return Err(LmsError::invalid_argument(format!(
            "phase shift {degrees}° needs {steps} steps"
        )));
    }
    Ok(steps as i32)
}

fn check_clock(clock: &FpgaPllClock) -> Result<()> {
    if clock.index >= MAX_CLOCKS {
        return Err(LmsError::invalid_argument(format!(
            "clock index {} out of range: {MAX_CLOCKS} counters",
            clock.index
        )));
    }
    if !(clock.out_frequency.is_finite() && clock.out_frequency > 0.0) {
        return Err(LmsError::invalid_argument(format!(
            "clock {} frequency {} Hz is not positive",
            clock.index, clock.out_frequency
        )));
    }
    if !clock.phase_shift_deg.is_finite() {
        return Err(LmsError::invalid_argument(format!(
            "clock {} phase shift is not finite",
            clock.index
        )));
    }
    Ok(())
}

fn check_reference(reference_hz: f64) -> Result<()> {
    if reference_hz.is_finite() && reference_hz > 0.0 {
        Ok(())
    } else {
        Err(LmsError::invalid_argument(format!(
            "reference frequency {reference_hz} Hz is not positive"
        )))
    }
}

/// Choose VCO, M, N and per-output C dividers for `clocks`.
///
/// VCO candidates are the multiples of every output that fall inside the
/// VCO window. The candidate divisible by the most outputs wins; among
/// those, the one closest to an exact `reference × M / N`, preferring the
/// higher VCO on ties.
pub fn plan(reference_hz: f64, clocks: &[FpgaPllClock]) -> Result<PllPlan> {
    check_reference(reference_hz)?;
    if clocks.is_empty() {
        return Err(LmsError::invalid_argument("no PLL outputs requested"));
    }
    for clock in clocks {
        check_clock(clock)?;
    }

    let mut candidates = Vec::new();
    for clock in clocks {
        let out = clock.out_frequency;
        if clock.bypass {
            if in_vco_window(out) {
                candidates.push(out);
            }
            continue;
        }
        let mut k = (VCO_MIN_HZ / out).ceil().max(1.0);
        while out * k <= VCO_MAX_HZ {
            if in_vco_window(out * k) {
                candidates.push(out * k);
            }
            k += 1.0;
        }
    }
    candidates.sort_by(|a, b| b.total_cmp(a));
    candidates.dedup_by(|a, b| (*a - *b).abs() < 1e-3);

    let mut best: Option<(usize, f64, u32, u32)> = None;
    for &vco in &candidates {
        let score = clocks.iter().filter(|c| divides_exactly(vco, c)).count();
        let Some((m, n, deviation)) = search_mn(reference_hz, vco) else {
            continue;
        };
        let better = match best {
            None => true,
            Some((best_score, best_dev, _, _)) => {
                score > best_score || (score == best_score && deviation < best_dev)
            }
        };
        if better {
            best = Some((score, deviation, m, n));
        }
    }
    let Some((_, _, m, n)) = best else {
        return Err(LmsError::invalid_argument(format!(
            "no VCO frequency within {}..{} MHz for the requested outputs",
            VCO_MIN_HZ / 1e6,
            VCO_MAX_HZ / 1e6
        )));
    };
    let vco_hz = reference_hz * f64::from(m) / f64::from(n);

    let counters = clocks
        .iter()
        .map(|clock| {
            let divider = if clock.bypass {
                1
            } else {
                let d = (vco_hz / clock.out_frequency).round();
                if d < 1.0 || d > f64::from(MAX_C_DIVIDER) {
                    return Err(LmsError::invalid_argument(format!(
                        "clock {} at {} Hz needs divider {d} from a {vco_hz} Hz VCO",
                        clock.index, clock.out_frequency
                    )));
                }
                d as u32
            };
            let achieved_hz = vco_hz / f64::from(divider);
            Ok(CounterPlan {
                index: clock.index,
                divider,
                bypass: clock.bypass,
                achieved_hz,
                phase_steps: phase_steps(clock.phase_shift_deg, achieved_hz, vco_hz)?,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(PllPlan {
        m,
        n,
        vco_hz,
        counters,
    })
}

/// Interpolator tap nearest `phase_deg` for direct clocking from `input_hz`.
pub fn direct_phase_tap(input_hz: f64, phase_deg: f64) -> Result<u16> {
    check_reference(input_hz)?;
    let step = 360.0 * input_hz / INTERPOLATOR_HZ;
    let tap = (phase_deg.rem_euclid(360.0) / step).round();
    if !(0.0..=f64::from(u16::MAX)).contains(&tap) {
        return Err(LmsError::invalid_argument(format!(
            "phase {phase_deg}° out of interpolator range at {input_hz} Hz"
        )));
    }
    Ok(tap as u16)
}

/// Programs the FPGA PLL through FPGA registers.
pub struct ClockSynthesizer {
    port: Arc<dyn ControlPort>,
    clock: SharedClock,
    poll: BoundedPoll,
}

impl ClockSynthesizer {
    /// Synthesizer over `port` with a 100 ms status poll.
    pub fn new(port: Arc<dyn ControlPort>) -> Self {
        Self {
            port,
            clock: system_clock(),
            poll: BoundedPoll::new(Duration::from_millis(100)),
        }
    }

    /// Use `clock` for status polls.
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Use `poll` as the status poll budget.
    pub fn with_poll(mut self, poll: BoundedPoll) -> Self {
        self.poll = poll;
        self
    }

    /// Program PLL `pll_index` for `clocks` from `reference_hz`.
    ///
    /// Fills in each clock's `achieved_frequency` and returns them in order.
    /// Clocks below [`DIRECT_CLOCK_LIMIT_HZ`] are switched to direct clocking
    /// and achieve the reference frequency.
    #[instrument(skip(self, clocks), fields(clocks = clocks.len()), err)]
    pub fn set_pll_frequency(
        &self,
        pll_index: u8,
        reference_hz: f64,
        clocks: &mut [FpgaPllClock],
    ) -> Result<Vec<f64>> {
        self.configure(pll_index, reference_hz, clocks).reported()
    }

    fn configure(
        &self,
        pll_index: u8,
        reference_hz: f64,
        clocks: &mut [FpgaPllClock],
    ) -> Result<Vec<f64>> {
        check_reference(reference_hz)?;
        if u16::from(pll_index) > reg::PLL_IND_MASK >> reg::PLL_IND_SHIFT {
            return Err(LmsError::invalid_argument(format!("PLL index {pll_index} out of range")));
        }
        for clock in clocks.iter() {
            check_clock(clock)?;
            if clock.is_direct() {
                direct_phase_tap(reference_hz, clock.phase_shift_deg)?;
            }
        }
        let pll_clocks: Vec<FpgaPllClock> = clocks.iter().filter(|c| !c.is_direct()).copied().collect();
        let plan = if pll_clocks.is_empty() {
            None
        } else {
            Some(plan(reference_hz, &pll_clocks)?)
        };

        for clock in clocks.iter_mut().filter(|c| c.is_direct()) {
            clock.achieved_frequency =
                self.direct_clock(clock.index, reference_hz, clock.phase_shift_deg)?;
        }

        if let Some(plan) = plan {
            self.program(pll_index, &plan)?;
            for (clock, counter) in clocks
                .iter_mut()
                .filter(|c| !c.is_direct())
                .zip(&plan.counters)
            {
                clock.achieved_frequency = counter.achieved_hz;
            }
            info!(
                pll = pll_index,
                vco_mhz = plan.vco_hz / 1e6,
                m = plan.m,
                n = plan.n,
                "PLL configured"
            );
        }
        Ok(clocks.iter().map(|c| c.achieved_frequency).collect())
    }

    /// Route `input_hz` straight to clock `clock_index` with the interpolator
    /// tap nearest `phase_deg`. Returns the achieved frequency, `input_hz`.
    #[instrument(skip(self), err)]
    pub fn set_direct_clocking(&self, clock_index: u8, input_hz: f64, phase_deg: f64) -> Result<f64> {
        self.direct_clock(clock_index, input_hz, phase_deg).reported()
    }

    fn direct_clock(&self, clock_index: u8, input_hz: f64, phase_deg: f64) -> Result<f64> {
        if clock_index >= MAX_CLOCKS {
            return Err(LmsError::invalid_argument(format!(
                "clock index {clock_index} out of range"
            )));
        }
        let tap = direct_phase_tap(input_hz, phase_deg)?;
        let port = self.port.as_ref();

        let enable = port.read_register(reg::DIRECT_CLOCK_EN)? | 1 << clock_index;
        let ctrl = (port.read_register(reg::DIRECT_CLOCK_CTRL)? & !(0x3FF | reg::LOAD_PH_REG))
            | reg::DIRECT_CNT_IND
            | u16::from(clock_index);
        port.write_register_batch(&[
            (reg::DIRECT_CLOCK_EN, enable),
            (reg::DIRECT_CLOCK_CTRL, ctrl),
            (reg::DIRECT_PHASE, tap),
            (reg::DIRECT_CLOCK_CTRL, ctrl | reg::LOAD_PH_REG),
            (reg::DIRECT_CLOCK_CTRL, ctrl),
        ])?;
        debug!(clock = clock_index, tap, "Direct clocking enabled");
        Ok(input_hz)
    }

    fn program(&self, pll_index: u8, plan: &PllPlan) -> Result<()> {
        let port = self.port.as_ref();

        let direct = plan
            .counters
            .iter()
            .fold(port.read_register(reg::DIRECT_CLOCK_EN)?, |v, c| v & !(1 << c.index));
        let ctrl = (port.read_register(reg::PLL_CTRL)?
            & !(reg::PLLCFG_START
                | reg::PHCFG_START
                | reg::PLLRST_START
                | reg::PLL_IND_MASK
                | reg::CNT_IND_MASK
                | reg::PHCFG_UPDN))
            | u16::from(pll_index) << reg::PLL_IND_SHIFT;
        port.write_register_batch(&[
            (reg::DIRECT_CLOCK_EN, direct),
            (reg::PLL_CTRL, ctrl | reg::PLLRST_START),
            (reg::PLL_CTRL, ctrl),
        ])?;

        let mut writes = plan.counter_writes();
        writes.push((reg::PLL_CTRL, ctrl | reg::PLLCFG_START));
        port.write_registers(&writes)?;
        self.wait_done("PLL configuration")?;
        port.write_register(reg::PLL_CTRL, ctrl)?;

        for counter in plan.counters.iter().filter(|c| !c.bypass) {
            let select = u16::from(counter.index + 2) << reg::CNT_IND_SHIFT;
            let direction = if counter.phase_steps >= 0 { reg::PHCFG_UPDN } else { 0 };
            let phase_ctrl = ctrl | select | direction;
            let steps = u16::try_from(counter.phase_steps.unsigned_abs()).unwrap_or(u16::MAX);
            port.write_register_batch(&[
                (reg::PLL_PHASE_STEPS, steps),
                (reg::PLL_CTRL, phase_ctrl | reg::PHCFG_START),
            ])?;
            self.wait_done("PLL phase configuration")?;
            port.write_register(reg::PLL_CTRL, phase_ctrl)?;
            debug!(clock = counter.index, steps = counter.phase_steps, "Phase configured");
        }
        Ok(())
    }

    fn wait_done(&self, what: &str) -> Result<()> {
        let port = self.port.as_ref();
        self.poll.run(self.clock.as_ref(), None, what, || {
            let status = port.read_register(reg::PLL_STATUS)?;
            let error = (status >> reg::PLL_ERROR_SHIFT) & 0xFF;
            if error != 0 {
                return Err(LmsError::busy(format!("{what} failed with error code {error}")));
            }
            Ok(if status & reg::PLL_DONE != 0 {
                PollStep::Ready(())
            } else {
                PollStep::Pending
            })
        })
    }
}

impl fmt::Debug for ClockSynthesizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClockSynthesizer")
            .field("poll", &self.poll)
            .finish_non_exhaustive()
    }
}
