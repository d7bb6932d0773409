//! In-memory stand-ins for the converter and its relay, used by tests.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::bus::{DataReady, SpiBus};
use super::codec::encode_24;
use super::registers::{cmd, reg, CHANNELS, FRAME_LEN, STATUS_MARKER};
use crate::drivers::Result;

#[derive(Debug)]
pub struct ChipState {
    pub regs: [u8; reg::COUNT],
    /// Value the ID register takes on reset.
    pub device_id: u8,
    pub continuous: bool,
    pub running: bool,
    /// Set when a register access arrives while the chip is in RDATAC mode.
    pub corrupted: bool,
    pub bad_status: bool,
    pub data_ready: bool,
    /// How long DRDY takes to fall once a conversion is due.
    pub conversion_time: Duration,
    pub samples: i32,
    pub log: Vec<Vec<u8>>,
}

impl ChipState {
    fn power_on() -> Self {
        let mut state = Self {
            regs: [0; reg::COUNT],
            device_id: 0x3E,
            continuous: true,
            running: false,
            corrupted: false,
            bad_status: false,
            data_ready: true,
            conversion_time: Duration::ZERO,
            samples: 0,
            log: Vec::new(),
        };
        state.reset_registers();
        state
    }

    fn reset_registers(&mut self) {
        self.regs = [0; reg::COUNT];
        self.regs[reg::ID as usize] = self.device_id;
        self.regs[reg::CONFIG1 as usize] = 0x96;
        self.regs[reg::CONFIG2 as usize] = 0xC0;
        self.regs[reg::CONFIG3 as usize] = 0x60;
        for ch in 0..CHANNELS {
            self.regs[reg::CH1SET as usize + ch] = 0x61;
        }
        self.continuous = true;
        self.running = false;
    }

    fn sample_frame(&mut self, buf: &mut [u8]) {
        self.samples += 1;
        buf[0] = if self.bad_status { 0x00 } else { STATUS_MARKER };
        buf[1] = 0;
        buf[2] = 0;
        for ch in 0..CHANNELS {
            let code = self.samples * (ch as i32 + 1);
            buf[3 + 3 * ch..6 + 3 * ch].copy_from_slice(&encode_24(code));
        }
    }

    /// Transfers logged since `from` that are single-byte commands.
    pub fn commands_since(&self, from: usize) -> Vec<u8> {
        self.log[from..]
            .iter()
            .filter(|tx| tx.len() == 1)
            .map(|tx| tx[0])
            .collect()
    }

    /// Opcode of every register or command transfer since `from`, in order.
    /// Sample reads are left out.
    pub fn opcodes_since(&self, from: usize) -> Vec<u8> {
        self.log[from..]
            .iter()
            .filter(|tx| !(tx.len() == FRAME_LEN && tx.iter().all(|b| *b == 0)))
            .map(|tx| tx[0])
            .collect()
    }

    pub fn channel_settings(&self) -> [u8; CHANNELS] {
        let mut out = [0u8; CHANNELS];
        out.copy_from_slice(&self.regs[reg::CH1SET as usize..reg::CH1SET as usize + CHANNELS]);
        out
    }
}

/// Register-accurate enough model of a directly wired converter.
#[derive(Clone)]
pub struct EmulatedChip {
    state: Arc<Mutex<ChipState>>,
}

impl EmulatedChip {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ChipState::power_on())),
        }
    }

    pub fn state(&self) -> MutexGuard<'_, ChipState> {
        self.state.lock().unwrap()
    }

    pub fn bus(&self) -> Box<dyn SpiBus> {
        Box::new(self.clone())
    }

    pub fn drdy(&self) -> Box<dyn DataReady> {
        Box::new(self.clone())
    }
}

impl SpiBus for EmulatedChip {
    fn transfer(&mut self, buf: &mut [u8]) -> Result<()> {
        let mut state = self.state();
        state.log.push(buf.to_vec());
        let opcode = buf[0];
        if buf.len() == 1 {
            match opcode {
                cmd::RESET => state.reset_registers(),
                cmd::SDATAC => state.continuous = false,
                cmd::RDATAC => state.continuous = true,
                cmd::START => state.running = true,
                cmd::STOP => state.running = false,
                _ => {}
            }
            return Ok(());
        }
        if buf.len() == FRAME_LEN && buf.iter().all(|b| *b == 0) {
            state.sample_frame(buf);
            return Ok(());
        }
        let base = (opcode & 0x1F) as usize;
        let count = buf[1] as usize + 1;
        match opcode & 0xE0 {
            cmd::RREG => {
                if state.continuous {
                    state.corrupted = true;
                    return Ok(());
                }
                for i in 0..count.min(buf.len() - 2) {
                    buf[2 + i] = state.regs.get(base + i).copied().unwrap_or(0);
                }
            }
            cmd::WREG => {
                if state.continuous {
                    state.corrupted = true;
                    return Ok(());
                }
                for i in 0..count.min(buf.len() - 2) {
                    // ID is read-only
                    if base + i != reg::ID as usize && base + i < reg::COUNT {
                        state.regs[base + i] = buf[2 + i];
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }
}

impl DataReady for EmulatedChip {
    fn wait_falling(&mut self, timeout: Duration) -> Result<bool> {
        let (ready, conversion) = {
            let state = self.state();
            (state.data_ready && state.running, state.conversion_time)
        };
        if !ready {
            std::thread::sleep(timeout);
        } else if !conversion.is_zero() {
            std::thread::sleep(conversion);
        }
        Ok(ready)
    }
}

#[derive(Debug, Default)]
pub struct RelayState {
    pub commands: Vec<Vec<u8>>,
    pub transactions: usize,
    pub data_ready: bool,
}

/// The microcontroller relay: returns batches of little-endian words and
/// records the command slot of every transaction.
#[derive(Clone)]
pub struct EmulatedRelay {
    state: Arc<Mutex<RelayState>>,
}

impl EmulatedRelay {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(RelayState {
                data_ready: true,
                ..RelayState::default()
            })),
        }
    }

    pub fn state(&self) -> MutexGuard<'_, RelayState> {
        self.state.lock().unwrap()
    }

    pub fn bus(&self) -> Box<dyn SpiBus> {
        Box::new(self.clone())
    }

    pub fn drdy(&self) -> Box<dyn DataReady> {
        Box::new(self.clone())
    }
}

impl SpiBus for EmulatedRelay {
    fn transfer(&mut self, buf: &mut [u8]) -> Result<()> {
        let mut state = self.state();
        if buf[0] == cmd::WREG {
            let len = if buf[1] == super::registers::relay_reg::CHANNEL { 4 } else { 3 };
            state.commands.push(buf[..len].to_vec());
        }
        let base = (state.transactions * buf.len() / 4) as i32;
        for (i, word) in buf.chunks_exact_mut(4).enumerate() {
            word.copy_from_slice(&(base + i as i32).to_le_bytes());
        }
        state.transactions += 1;
        Ok(())
    }
}

impl DataReady for EmulatedRelay {
    fn wait_falling(&mut self, timeout: Duration) -> Result<bool> {
        let ready = self.state().data_ready;
        if !ready {
            std::thread::sleep(timeout);
        }
        Ok(ready)
    }
}
