use std::thread;
use crate::core::config::LinkTiming;
use crate::core::gpio::TxPort;

/*
  Line encoding: one byte is three clock ticks. The data bundle carries a
  3-bit value per tick; tick 0 is byte[2:0], tick 1 is byte[5:3], tick 2
  holds byte[7:6] on the low two lines with the third line undefined.
 */

pub struct ByteShifter<'a> {
    port: &'a TxPort,
    timing: &'a LinkTiming,
}

impl<'a> ByteShifter<'a> {
    pub fn new(port: &'a TxPort, timing: &'a LinkTiming) -> ByteShifter<'a> {
        ByteShifter { port, timing }
    }

    pub fn send_byte(&self, byte: u8) {
        self.send_tick(byte & 0x07);
        self.send_tick((byte >> 3) & 0x07);
        self.send_tick((byte >> 6) & 0x03);
        // let the receiver flush the assembled byte through its state machine
        thread::sleep(self.timing.inter_byte_gap);
    }

    fn send_tick(&self, value: u8) {
        self.port.drive_data(value);
        thread::sleep(self.timing.data_settle);
        self.port.clock.set(true);
        thread::sleep(self.timing.clock_hold);
        self.port.clock.set(false);
        thread::sleep(self.timing.inter_tick_gap);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Tick absorbed, byte not complete yet
    Pending,
    /// A full byte fell out of the accumulator
    Byte(u8),
    /// Too many invalid ticks in a row, caller must force a reset
    Desync,
}

/// Reassembles bytes from 3-bit ticks. The third tick of every byte is
/// masked to its two meaningful bits, so `bit_position` only ever rests
/// at 0, 3 or 6 and bytes re-align on every emission; whatever the far
/// end drives on the unused line cannot shear the stream.
#[derive(Debug)]
pub struct TickAssembler {
    accumulator: u16,
    bit_position: u8,
    invalid_run: u32,
}

impl TickAssembler {
    pub fn new() -> TickAssembler {
        TickAssembler {
            accumulator: 0,
            bit_position: 0,
            invalid_run: 0,
        }
    }

    pub fn reset(&mut self) {
        self.accumulator = 0;
        self.bit_position = 0;
        self.invalid_run = 0;
    }

    pub fn push(&mut self, data: u8, max_invalid: u32) -> TickOutcome {
        if data > 7 {
            self.invalid_run += 1;
            if self.invalid_run >= max_invalid {
                return TickOutcome::Desync;
            }
            return TickOutcome::Pending;
        }
        self.invalid_run = 0;

        let width = if self.bit_position == 6 { 2 } else { 3 };
        let masked = data & ((1u8 << width) - 1);
        self.accumulator |= (masked as u16) << self.bit_position;
        self.bit_position += width;

        if self.bit_position >= 8 {
            let byte = (self.accumulator & 0xFF) as u8;
            self.accumulator >>= 8;
            self.bit_position -= 8;
            TickOutcome::Byte(byte)
        } else {
            TickOutcome::Pending
        }
    }
}

impl Default for TickAssembler {
    fn default() -> Self {
        Self::new()
    }
}
