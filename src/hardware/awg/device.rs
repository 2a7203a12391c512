//! Register-level access to Spectrum cards and star-hubs.
//!
//! [`SpcmDevice`] mirrors the handful of driver entry points the AWG code
//! needs. The simulated implementations keep a register file and record
//! every write and DMA transfer so tests can inspect them.

use super::regs::*;
use std::collections::HashMap;
use std::sync::Mutex;

/// One open driver handle (a card or a star-hub).
pub trait SpcmDevice: Send + Sync {
    /// Write a 32-bit register
    fn set32(&self, register: i32, value: i32);
    /// Read a 32-bit register
    fn get32(&self, register: i32) -> i32;
    /// Write a 64-bit register
    fn set64(&self, register: i32, value: i64);
    /// Read a 64-bit register
    fn get64(&self, register: i32) -> i64;
    /// Define a PC-to-card data transfer starting at `offset_bytes`
    fn def_transfer(&self, offset_bytes: u64, samples: &[i16]);
    /// Pending error text, cleared by reading it
    fn error_info(&self) -> Option<String>;
    /// Release the handle
    fn close(&self);
}

/// One recorded DMA definition.
#[derive(Debug, Clone, PartialEq)]
pub struct Transfer {
    /// Card memory offset in bytes
    pub offset_bytes: u64,
    /// Interleaved sample buffer
    pub samples: Vec<i16>,
}

#[derive(Default)]
struct RegisterFile {
    registers: HashMap<i32, i64>,
    writes: Vec<(i32, i64)>,
    transfers: Vec<Transfer>,
    pending_error: Option<String>,
    closed: bool,
}

impl RegisterFile {
    fn read(&self, register: i32) -> i64 {
        match register {
            SPC_CHCOUNT => i64::from(self.value(SPC_CHENABLE).count_ones()),
            SPC_MIINST_BYTESPERSAMPLE => 2,
            _ => self.value(register),
        }
    }

    fn value(&self, register: i32) -> i64 {
        self.registers.get(&register).copied().unwrap_or(0)
    }

    fn write(&mut self, register: i32, value: i64) {
        self.writes.push((register, value));
        if register == SPC_M2CMD {
            self.command(value as i32);
        } else {
            self.registers.insert(register, value);
        }
    }

    fn command(&mut self, cmd: i32) {
        let mut status = self.value(SPC_M2STATUS) as i32;
        if cmd & M2CMD_CARD_RESET != 0 {
            self.registers.retain(|r, _| {
                *r == SPC_PCISERIALNO
                    || *r == SPC_SYNC_READ_SYNCCOUNT
                    || SPC_SYNC_READ_CARDIDX.contains(r)
            });
            status = M2STAT_CARD_READY;
        }
        if cmd & M2CMD_CARD_START != 0 {
            status &= !M2STAT_CARD_READY;
        }
        if cmd & M2CMD_CARD_FORCETRIGGER != 0 {
            status |= M2STAT_CARD_TRIGGER;
        }
        if cmd & M2CMD_CARD_STOP != 0 {
            status = (status & !M2STAT_CARD_TRIGGER) | M2STAT_CARD_READY;
        }
        if cmd & M2CMD_DATA_STARTDMA != 0 {
            status |= M2STAT_DATA_END;
        }
        self.registers.insert(SPC_M2STATUS, i64::from(status));
    }
}

/// In-memory stand-in for one M4i card.
pub struct SimulatedCard {
    inner: Mutex<RegisterFile>,
}

impl SimulatedCard {
    /// Card reporting `serial`, ready and idle.
    pub fn new(serial: i32) -> Self {
        let mut file = RegisterFile::default();
        file.registers.insert(SPC_PCISERIALNO, i64::from(serial));
        file.registers.insert(SPC_M2STATUS, i64::from(M2STAT_CARD_READY));
        Self {
            inner: Mutex::new(file),
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut RegisterFile) -> R) -> R {
        let mut file = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut file)
    }

    /// Current register value (0 when never written).
    pub fn register(&self, register: i32) -> i64 {
        self.with(|f| f.read(register))
    }

    /// Every register write in order, including commands.
    pub fn writes(&self) -> Vec<(i32, i64)> {
        self.with(|f| f.writes.clone())
    }

    /// Values written to [`SPC_M2CMD`].
    pub fn commands(&self) -> Vec<i32> {
        self.with(|f| {
            f.writes
                .iter()
                .filter(|(r, _)| *r == SPC_M2CMD)
                .map(|(_, v)| *v as i32)
                .collect()
        })
    }

    /// DMA transfers defined so far.
    pub fn transfers(&self) -> Vec<Transfer> {
        self.with(|f| f.transfers.clone())
    }

    /// Report `text` on the next error check.
    pub fn inject_error(&self, text: &str) {
        self.with(|f| f.pending_error = Some(text.to_string()));
    }

    /// Whether the handle was closed.
    pub fn is_closed(&self) -> bool {
        self.with(|f| f.closed)
    }
}

impl SpcmDevice for SimulatedCard {
    fn set32(&self, register: i32, value: i32) {
        self.with(|f| f.write(register, i64::from(value)));
    }

    fn get32(&self, register: i32) -> i32 {
        self.with(|f| f.read(register) as i32)
    }

    fn set64(&self, register: i32, value: i64) {
        self.with(|f| f.write(register, value));
    }

    fn get64(&self, register: i32) -> i64 {
        self.with(|f| f.read(register))
    }

    fn def_transfer(&self, offset_bytes: u64, samples: &[i16]) {
        self.with(|f| {
            f.transfers.push(Transfer {
                offset_bytes,
                samples: samples.to_vec(),
            })
        });
    }

    fn error_info(&self) -> Option<String> {
        self.with(|f| f.pending_error.take())
    }

    fn close(&self) {
        self.with(|f| f.closed = true);
    }
}

/// In-memory star-hub with a fixed set of cards behind it.
pub struct SimulatedHub {
    file: SimulatedCard,
}

impl SimulatedHub {
    /// Hub connecting the cards with the given numbers, in index order.
    pub fn new(card_numbers: &[i32]) -> Self {
        let file = SimulatedCard::new(0);
        file.with(|f| {
            f.registers
                .insert(SPC_SYNC_READ_SYNCCOUNT, card_numbers.len() as i64);
            for (register, number) in SPC_SYNC_READ_CARDIDX.iter().zip(card_numbers) {
                f.registers.insert(*register, i64::from(*number));
            }
        });
        Self { file }
    }

    /// Register view, as for [`SimulatedCard::register`].
    pub fn register(&self, register: i32) -> i64 {
        self.file.register(register)
    }

    /// Values written to [`SPC_M2CMD`].
    pub fn commands(&self) -> Vec<i32> {
        self.file.commands()
    }

    /// Report `text` on the next error check.
    pub fn inject_error(&self, text: &str) {
        self.file.inject_error(text)
    }

    /// Whether the handle was closed.
    pub fn is_closed(&self) -> bool {
        self.file.is_closed()
    }
}

impl SpcmDevice for SimulatedHub {
    fn set32(&self, register: i32, value: i32) {
        self.file.set32(register, value)
    }

    fn get32(&self, register: i32) -> i32 {
        self.file.get32(register)
    }

    fn set64(&self, register: i32, value: i64) {
        self.file.set64(register, value)
    }

    fn get64(&self, register: i32) -> i64 {
        self.file.get64(register)
    }

    fn def_transfer(&self, offset_bytes: u64, samples: &[i16]) {
        self.file.def_transfer(offset_bytes, samples)
    }

    fn error_info(&self) -> Option<String> {
        self.file.error_info()
    }

    fn close(&self) {
        self.file.close()
    }
}
