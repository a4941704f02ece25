//! Local APIC timer.
//!
//! The timer is calibrated once against the PIT, then programmed in periodic mode on
//! `TIMER_VECTOR`. Every tick must be acknowledged with `eoi`.

use log::{debug, info};
use x2apic::lapic::{xapic_base, LocalApic, LocalApicBuilder, TimerDivide, TimerMode};
use x86_64::instructions::port::Port;

use crate::constants::{
    idt::{ERROR_VECTOR, SPURIOUS_VECTOR, TIMER_VECTOR},
    ports::{PIT_CHANNEL_0, PIT_MODE_CMD},
    x2apic::TIMER_PERIOD_MS,
};

#[derive(Debug)]
pub enum ApicError {
    TimerOverflow,
    CalibrationFailed,
    ApicInitFailed,
    PitTimeout,
}

impl core::fmt::Display for ApicError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ApicError::TimerOverflow => write!(f, "Timer period overflows the APIC counter"),
            ApicError::CalibrationFailed => write!(f, "APIC timer calibration out of range"),
            ApicError::ApicInitFailed => write!(f, "Local APIC could not be configured"),
            ApicError::PitTimeout => write!(f, "PIT never finished counting down"),
        }
    }
}

const PIT_FREQ: u32 = 1193182;

/// Length of the calibration window in milliseconds.
const CALIBRATION_MS: u16 = 50;

fn builder(mode: TimerMode) -> LocalApicBuilder {
    let mut builder = LocalApicBuilder::new();
    builder
        .set_xapic_base(unsafe { xapic_base() })
        .timer_vector(TIMER_VECTOR as usize)
        .error_vector(ERROR_VECTOR as usize)
        .spurious_vector(SPURIOUS_VECTOR as usize)
        .timer_mode(mode)
        .timer_divide(TimerDivide::Div2);
    builder
}

fn local_apic(mode: TimerMode, initial: u32) -> Result<LocalApic, ApicError> {
    builder(mode)
        .timer_initial(initial)
        .build()
        .map_err(|_| ApicError::ApicInitFailed)
}

/// Calibrates the timer and starts periodic ticks every `TIMER_PERIOD_MS`.
pub fn init_timer() -> Result<(), ApicError> {
    let ticks_per_ms = calibrate_apic_timer()?;
    let ticks = ticks_per_ms
        .checked_mul(TIMER_PERIOD_MS)
        .ok_or(ApicError::TimerOverflow)?;

    let mut lapic = local_apic(TimerMode::Periodic, ticks)?;
    unsafe {
        lapic.enable();
        lapic.enable_timer();
    }

    info!(
        "APIC timer: {} ticks/ms, interrupt every {} ms",
        ticks_per_ms, TIMER_PERIOD_MS
    );
    Ok(())
}

/// Acknowledges the interrupt being serviced.
pub fn eoi() -> Result<(), ApicError> {
    let mut lapic = local_apic(TimerMode::Periodic, 0)?;
    unsafe {
        lapic.end_of_interrupt();
    }
    Ok(())
}

/// Channel 0, lobyte/hibyte access, mode 2 (rate generator).
const PIT_RATE_GENERATOR: u8 = 0x34;
/// Channel 0, lobyte/hibyte access, mode 3 (square wave), the firmware default.
const PIT_SQUARE_WAVE: u8 = 0x36;
const PIT_LATCH_CHANNEL_0: u8 = 0x00;

/// Polls of the PIT before calibration gives up.
const PIT_POLL_LIMIT: usize = 1_000_000;

/// Programmable interval timer, channel 0. Only used as a reference clock.
struct Pit {
    data: Port<u8>,
    command: Port<u8>,
}

impl Pit {
    const fn new() -> Self {
        Self {
            data: Port::new(PIT_CHANNEL_0),
            command: Port::new(PIT_MODE_CMD),
        }
    }

    unsafe fn program(&mut self, mode: u8, reload: u16) {
        let [low, high] = reload.to_le_bytes();
        self.command.write(mode);
        self.data.write(low);
        self.data.write(high);
    }

    unsafe fn count(&mut self) -> u16 {
        self.command.write(PIT_LATCH_CHANNEL_0);
        let low = self.data.read();
        let high = self.data.read();
        u16::from_le_bytes([low, high])
    }

    /// Starts counting down from `reload` and spins until that many PIT ticks elapsed.
    unsafe fn count_down(&mut self, reload: u16) -> Result<(), ApicError> {
        self.program(PIT_RATE_GENERATOR, reload);

        let mut last = self.count();
        let mut elapsed: u32 = 0;
        for _ in 0..PIT_POLL_LIMIT {
            let now = self.count();
            // a reading above the last one means the counter reloaded in between
            elapsed += if now > last {
                u32::from(last) + u32::from(reload.wrapping_sub(now))
            } else {
                u32::from(last - now)
            };
            if elapsed >= u32::from(reload) {
                return Ok(());
            }
            last = now;
            core::hint::spin_loop();
        }
        Err(ApicError::PitTimeout)
    }

    unsafe fn restore(&mut self) {
        self.program(PIT_SQUARE_WAVE, 0);
    }
}

/// Counts APIC timer ticks across a known PIT interval.
fn calibrate_apic_timer() -> Result<u32, ApicError> {
    let mut pit = Pit::new();
    let mut lapic = local_apic(TimerMode::OneShot, 0)?;
    let reload = (PIT_FREQ * u32::from(CALIBRATION_MS) / 1000) as u16;

    let elapsed = unsafe {
        lapic.enable();
        lapic.enable_timer();
        lapic.set_timer_initial(u32::MAX);
        let waited = pit.count_down(reload);
        let remaining = lapic.timer_current();
        lapic.set_timer_initial(0);
        pit.restore();
        waited?;
        u32::MAX - remaining
    };

    let ticks_per_ms = elapsed / u32::from(CALIBRATION_MS);
    debug!("APIC counted {} ticks in {} ms", elapsed, CALIBRATION_MS);

    if !(1_000..=1_000_000).contains(&ticks_per_ms) {
        return Err(ApicError::CalibrationFailed);
    }
    Ok(ticks_per_ms)
}
