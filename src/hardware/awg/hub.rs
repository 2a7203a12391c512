//! Star-hub synchronising the cards.

use super::device::SpcmDevice;
use super::regs::*;
use crate::error::DaqError;
use anyhow::Result;
use std::sync::Arc;
use tracing::error;

/// Commands issued through the hub reach every synchronised card.
pub struct Hub {
    number: i32,
    device: Arc<dyn SpcmDevice>,
}

impl Hub {
    /// Hub `number` behind `device`.
    pub fn new(number: i32, device: Arc<dyn SpcmDevice>) -> Self {
        Self { number, device }
    }

    fn check(&self) -> Result<()> {
        match self.device.error_info() {
            None => Ok(()),
            Some(text) => {
                error!(hub = self.number, error = %text, "Star-hub reported an error");
                Err(DaqError::Instrument(format!("hub {}: {}", self.number, text)).into())
            }
        }
    }

    fn command(&self, cmd: i32) -> Result<()> {
        self.device.set32(SPC_M2CMD, cmd);
        self.check()
    }

    fn get(&self, register: i32) -> Result<i32> {
        let value = self.device.get32(register);
        self.check()?;
        Ok(value)
    }

    /// Number of cards on the hub
    pub fn get_card_count(&self) -> Result<i32> {
        self.get(SPC_SYNC_READ_SYNCCOUNT)
    }

    /// Card number at hub slot `index`.
    pub fn get_card_of_index(&self, index: usize) -> Result<i32> {
        let register = SPC_SYNC_READ_CARDIDX
            .get(index)
            .copied()
            .ok_or_else(|| DaqError::InvalidArgument(format!("no hub slot {}", index)))?;
        self.get(register)
    }

    /// Card numbers in hub slot order.
    pub fn card_indices(&self) -> Result<Vec<i32>> {
        let count = self.get_card_count()?.max(0) as usize;
        (0..count).map(|i| self.get_card_of_index(i)).collect()
    }

    /// Hub serial number
    pub fn get_serial(&self) -> Result<i32> {
        self.get(SPC_PCISERIALNO)
    }

    /// Synchronise every connected card.
    pub fn sync_all_cards(&self) -> Result<()> {
        let count = self.get_card_count()?;
        self.device.set32(SPC_SYNC_ENABLEMASK, (1 << count) - 1);
        self.check()
    }

    /// Start with triggers enabled and force the first trigger.
    pub fn start_triggered(&self) -> Result<()> {
        self.command(M2CMD_CARD_START | M2CMD_CARD_ENABLETRIGGER | M2CMD_CARD_FORCETRIGGER)
    }

    /// Start and wait for an external trigger.
    pub fn start_enable_trigger(&self) -> Result<()> {
        self.command(M2CMD_CARD_START | M2CMD_CARD_ENABLETRIGGER)
    }

    /// Start without enabling triggers
    pub fn start(&self) -> Result<()> {
        self.command(M2CMD_CARD_START)
    }

    /// Stop replay
    pub fn stop(&self) -> Result<()> {
        self.command(M2CMD_CARD_STOP)
    }

    /// Reset all cards
    pub fn reset(&self) -> Result<()> {
        self.command(M2CMD_CARD_RESET)
    }

    /// Write settings without starting
    pub fn write_setup(&self) -> Result<()> {
        self.command(M2CMD_CARD_WRITESETUP)
    }

    /// Let triggers take effect
    pub fn enable_trigger(&self) -> Result<()> {
        self.command(M2CMD_CARD_ENABLETRIGGER)
    }

    /// Force one trigger event
    pub fn force_trigger(&self) -> Result<()> {
        self.command(M2CMD_CARD_FORCETRIGGER)
    }

    /// Ignore all triggers
    pub fn disable_trigger(&self) -> Result<()> {
        self.command(M2CMD_CARD_DISABLETRIGGER)
    }

    /// Block until the next trigger
    pub fn wait_trigger(&self) -> Result<()> {
        self.command(M2CMD_CARD_WAITTRIGGER)
    }

    /// Block until the run completed
    pub fn wait_ready(&self) -> Result<()> {
        self.command(M2CMD_CARD_WAITREADY)
    }

    /// Release the driver handle
    pub fn close(&self) {
        self.device.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::awg::device::SimulatedHub;

    #[test]
    fn enumerates_and_syncs_cards() {
        let sim = Arc::new(SimulatedHub::new(&[0, 1]));
        let hub = Hub::new(0, sim.clone());
        assert_eq!(hub.card_indices().unwrap(), vec![0, 1]);
        hub.sync_all_cards().unwrap();
        assert_eq!(sim.register(SPC_SYNC_ENABLEMASK), 0b11);
        assert!(hub.get_card_of_index(7).is_err());
    }

    #[test]
    fn commands_go_through_m2cmd() {
        let sim = Arc::new(SimulatedHub::new(&[0, 1]));
        let hub = Hub::new(0, sim.clone());
        hub.start_triggered().unwrap();
        hub.stop().unwrap();
        assert_eq!(
            sim.commands(),
            vec![
                M2CMD_CARD_START | M2CMD_CARD_ENABLETRIGGER | M2CMD_CARD_FORCETRIGGER,
                M2CMD_CARD_STOP
            ]
        );
        sim.inject_error("timeout");
        assert!(hub.wait_ready().is_err());
    }
}
