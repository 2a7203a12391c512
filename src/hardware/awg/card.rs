//! One M4i generator card.

use super::device::SpcmDevice;
use super::regs::*;
use crate::error::DaqError;
use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error};

/// Largest sequence memory the cards support.
pub const MAX_SEGMENTS: usize = 1 << 15;

/// Replay mode of a card.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardMode {
    /// Play memory once per trigger
    Single,
    /// Play segments per trigger
    Multi,
    /// Play while the gate is high
    Gate,
    /// Replay on every trigger
    SingleRestart,
    /// Step through sequence memory
    Sequence,
    /// Loop memory forever
    Continuous,
    /// Streaming, single
    FifoSingle,
    /// Streaming, multi
    FifoMulti,
    /// Streaming, gated
    FifoGate,
}

impl CardMode {
    const ALL: [CardMode; 9] = [
        CardMode::Single,
        CardMode::Multi,
        CardMode::Gate,
        CardMode::SingleRestart,
        CardMode::Sequence,
        CardMode::Continuous,
        CardMode::FifoSingle,
        CardMode::FifoMulti,
        CardMode::FifoGate,
    ];

    fn register_value(self) -> i32 {
        match self {
            CardMode::Single => SPC_REP_STD_SINGLE,
            CardMode::Multi => SPC_REP_STD_MULTI,
            CardMode::Gate => SPC_REP_STD_GATE,
            CardMode::SingleRestart => SPC_REP_STD_SINGLERESTART,
            CardMode::Sequence => SPC_REP_STD_SEQUENCE,
            CardMode::Continuous => SPC_REP_STD_CONTINUOUS,
            CardMode::FifoSingle => SPC_REP_FIFO_SINGLE,
            CardMode::FifoMulti => SPC_REP_FIFO_MULTI,
            CardMode::FifoGate => SPC_REP_FIFO_GATE,
        }
    }

    /// Mode for a register value
    pub fn from_register(value: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.register_value() == value)
    }

    /// Short name used in configuration and logs
    pub fn name(self) -> &'static str {
        match self {
            CardMode::Single => "single",
            CardMode::Multi => "multi",
            CardMode::Gate => "gate",
            CardMode::SingleRestart => "singlerestart",
            CardMode::Sequence => "sequence",
            CardMode::Continuous => "continuous",
            CardMode::FifoSingle => "fifo_single",
            CardMode::FifoMulti => "fifo_multi",
            CardMode::FifoGate => "fifo_gate",
        }
    }
}

impl std::str::FromStr for CardMode {
    type Err = DaqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|m| m.name() == s)
            .ok_or_else(|| DaqError::InvalidArgument(format!("unknown card mode '{}'", s)))
    }
}

/// Output level after a waveform ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopLevel {
    /// 0 V
    Zero,
    /// Low rail
    Low,
    /// High rail
    High,
    /// Last sample
    Hold,
}

impl StopLevel {
    fn register_value(self) -> i32 {
        match self {
            StopLevel::Zero => SPCM_STOPLVL_ZERO,
            StopLevel::Low => SPCM_STOPLVL_LOW,
            StopLevel::High => SPCM_STOPLVL_HIGH,
            StopLevel::Hold => SPCM_STOPLVL_HOLDLAST,
        }
    }

    fn from_register(value: i32) -> Option<Self> {
        [StopLevel::Zero, StopLevel::Low, StopLevel::High, StopLevel::Hold]
            .into_iter()
            .find(|l| l.register_value() == value)
    }
}

/// External trigger edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerMode {
    /// Rising edge
    PosEdge,
    /// Falling edge
    NegEdge,
}

impl TriggerMode {
    fn register_value(self) -> i32 {
        match self {
            TriggerMode::PosEdge => SPC_TM_POS,
            TriggerMode::NegEdge => SPC_TM_NEG,
        }
    }
}

/// When a sequence step hands over to the next one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepCondition {
    /// After its loops
    Always,
    /// After its loops, on the next trigger
    OnTrigger,
    /// Stop the sequence
    Stop,
}

impl StepCondition {
    fn register_value(self) -> i64 {
        match self {
            StepCondition::Always => SPCSEQ_ENDLOOPALWAYS,
            StepCondition::OnTrigger => SPCSEQ_ENDLOOPONTRIG,
            StepCondition::Stop => SPCSEQ_END,
        }
    }
}

/// Decoded `SPC_M2STATUS` card bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardState {
    /// Run completed
    Ready,
    /// First trigger has been detected
    Triggered,
    /// Neither bit set
    Unknown,
}

/// Decoded `SPC_M2STATUS` data bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    /// Transfer finished
    Finished,
    /// Error during transfer
    Error,
    /// Overrun during transfer
    Overrun,
    /// Neither bit set
    Unknown,
}

/// Samples for one card: two analog channels and three markers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CardData {
    /// Analog channel 0
    pub ch0: Vec<i16>,
    /// Analog channel 1
    pub ch1: Vec<i16>,
    /// Marker lines X0..X2
    pub markers: [Vec<bool>; 3],
}

/// Pad to a multiple of 32 samples (and 192 minimum for segments).
pub fn padded_len(samples: usize, sequence_segment: bool) -> usize {
    let mut padded = samples.div_ceil(32) * 32;
    if sequence_segment {
        padded = padded.max(192);
    }
    padded
}

/// Interleave channels for DMA, folding markers into the sample MSBs.
pub fn interleave(samples: usize, used_channels: usize, data: &CardData, markers: bool) -> Vec<i16> {
    let padded = padded_len(samples, false).max(samples);
    let mut buffer = vec![0i16; padded * used_channels.max(1)];
    let at = |v: &Vec<i16>, i: usize| i32::from(v.get(i).copied().unwrap_or(0));
    let bit = |v: &Vec<bool>, i: usize| i32::from(v.get(i).copied().unwrap_or(false));

    for i in 0..samples {
        let scale = if markers { 4 } else { 1 };
        let mut a = at(&data.ch0, i).div_euclid(scale);
        if markers {
            a += bit(&data.markers[0], i) << 14;
        }
        buffer[i * used_channels] = a as i16;

        if used_channels > 1 {
            let mut b = at(&data.ch1, i).div_euclid(scale);
            if markers {
                b += -(bit(&data.markers[1], i) << 15) + (bit(&data.markers[2], i) << 14);
            }
            buffer[i * used_channels + 1] = b as i16;
        }
    }
    buffer
}

/// Register access plus error checking for one card.
#[derive(Clone)]
pub struct Card {
    number: i32,
    device: Arc<dyn SpcmDevice>,
    markers_enabled: Arc<AtomicBool>,
}

impl Card {
    /// Card `number` behind `device`.
    pub fn new(number: i32, device: Arc<dyn SpcmDevice>) -> Self {
        Self {
            number,
            device,
            markers_enabled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Card number on the hub.
    pub fn number(&self) -> i32 {
        self.number
    }

    fn check(&self) -> Result<()> {
        match self.device.error_info() {
            None => Ok(()),
            Some(text) => {
                error!(card = self.number, error = %text, "Card reported an error");
                Err(DaqError::Instrument(format!("card {}: {}", self.number, text)).into())
            }
        }
    }

    fn set(&self, register: i32, value: i32) -> Result<()> {
        self.device.set32(register, value);
        self.check()
    }

    fn get(&self, register: i32) -> Result<i32> {
        let value = self.device.get32(register);
        self.check()?;
        Ok(value)
    }

    fn command(&self, cmd: i32) -> Result<()> {
        self.set(SPC_M2CMD, cmd)
    }

    /// Route markers X0..X2 to bits 14/15 of the analog samples, or turn
    /// them off.
    pub fn init_markers(&self, enable: bool) -> Result<()> {
        if enable {
            self.set(
                SPCM_X0_MODE,
                SPCM_XMODE_DIGOUT | SPCM_XMODE_DIGOUTSRC_CH0 | SPCM_XMODE_DIGOUTSRC_BIT14,
            )?;
            self.set(
                SPCM_X1_MODE,
                SPCM_XMODE_DIGOUT | SPCM_XMODE_DIGOUTSRC_CH1 | SPCM_XMODE_DIGOUTSRC_BIT15,
            )?;
            self.set(
                SPCM_X2_MODE,
                SPCM_XMODE_DIGOUT | SPCM_XMODE_DIGOUTSRC_CH1 | SPCM_XMODE_DIGOUTSRC_BIT14,
            )?;
        } else {
            self.set(SPCM_X0_MODE, SPCM_XMODE_DISABLE)?;
            self.set(SPCM_X1_MODE, SPCM_XMODE_DISABLE)?;
            self.set(SPCM_X2_MODE, SPCM_XMODE_DISABLE)?;
        }
        self.markers_enabled.store(enable, Ordering::SeqCst);
        Ok(())
    }

    /// Whether markers are folded into the samples.
    pub fn markers_enabled(&self) -> bool {
        self.markers_enabled.load(Ordering::SeqCst)
    }

    /// Use the internal PLL clock.
    pub fn use_internal_pll(&self) -> Result<()> {
        self.set(SPC_CLOCKMODE, SPC_CM_INTPLL)
    }

    /// Start replay
    pub fn start(&self) -> Result<()> {
        self.command(M2CMD_CARD_START)
    }

    /// Stop replay
    pub fn stop(&self) -> Result<()> {
        self.command(M2CMD_CARD_STOP)
    }

    /// Reset to power-on defaults
    pub fn reset(&self) -> Result<()> {
        self.command(M2CMD_CARD_RESET)
    }

    /// Write all settings without starting.
    pub fn write_setup(&self) -> Result<()> {
        self.command(M2CMD_CARD_WRITESETUP)
    }

    /// PCI serial number
    pub fn get_serial(&self) -> Result<i32> {
        self.get(SPC_PCISERIALNO)
    }

    /// Timeout of wait commands in ms (0 disables it).
    pub fn set_wait_timeout(&self, ms: i32) -> Result<()> {
        self.set(SPC_TIMEOUT, ms)
    }

    /// Timeout of wait commands in ms
    pub fn get_wait_timeout(&self) -> Result<i32> {
        self.get(SPC_TIMEOUT)
    }

    /// Replays per event (0 = continuous).
    pub fn set_loops(&self, loops: i32) -> Result<()> {
        self.set(SPC_LOOPS, loops)
    }

    /// Replays per event
    pub fn get_loops(&self) -> Result<i32> {
        self.get(SPC_LOOPS)
    }

    /// Lower level of external trigger `input` in mV.
    pub fn set_trigger_level0(&self, input: usize, millivolts: i32) -> Result<()> {
        self.set(SPC_TRIG_EXT_LEVEL0[input & 1], millivolts)
    }

    /// Lower level of external trigger `input` in mV
    pub fn get_trigger_level0(&self, input: usize) -> Result<i32> {
        self.get(SPC_TRIG_EXT_LEVEL0[input & 1])
    }

    /// Edge of external trigger `input`.
    pub fn set_trigger_mode(&self, input: usize, mode: TriggerMode) -> Result<()> {
        self.set(SPC_TRIG_EXT_MODE[input & 1], mode.register_value())
    }

    /// Edge of external trigger `input`, `None` for other modes.
    pub fn get_trigger_mode(&self, input: usize) -> Result<Option<TriggerMode>> {
        let value = self.get(SPC_TRIG_EXT_MODE[input & 1])?;
        Ok([TriggerMode::PosEdge, TriggerMode::NegEdge]
            .into_iter()
            .find(|m| m.register_value() == value))
    }

    /// Select which external inputs feed the trigger OR mask.
    pub fn set_trigger_ormask(&self, ext0: bool, ext1: bool) -> Result<()> {
        let mut mask = 0;
        if ext0 {
            mask |= SPC_TMASK_EXT0;
        }
        if ext1 {
            mask |= SPC_TMASK_EXT1;
        }
        self.set(SPC_TRIG_ORMASK, mask)
    }

    /// Whether external `input` is in the OR mask.
    pub fn get_trigger_in_ormask(&self, input: usize) -> Result<bool> {
        let flag = match input {
            0 => SPC_TMASK_EXT0,
            1 => SPC_TMASK_EXT1,
            other => {
                return Err(DaqError::InvalidArgument(format!("unknown trigger input {}", other)).into())
            }
        };
        Ok(self.get(SPC_TRIG_ORMASK)? & flag != 0)
    }

    /// Channels reacting to the trigger OR mask, one bit per channel.
    pub fn set_triggered_channels_ormask(&self, channels: i32) -> Result<()> {
        self.set(SPC_TRIG_CH_ORMASK0, channels)
    }

    /// Trigger input termination: `true` for 50 Ohm, `false` for 1 kOhm.
    pub fn set_trigger_termination(&self, fifty_ohm: bool) -> Result<()> {
        self.set(SPC_TRIG_TERM, i32::from(fifty_ohm))
    }

    /// Card run state
    pub fn get_state(&self) -> Result<CardState> {
        let status = self.get(SPC_M2STATUS)?;
        Ok(if status & M2STAT_CARD_READY != 0 {
            CardState::Ready
        } else if status & M2STAT_CARD_TRIGGER != 0 {
            CardState::Triggered
        } else {
            CardState::Unknown
        })
    }

    /// DMA state
    pub fn get_datatransfer_state(&self) -> Result<TransferState> {
        let status = self.get(SPC_M2STATUS)?;
        Ok(if status & M2STAT_DATA_END != 0 {
            TransferState::Finished
        } else if status & M2STAT_DATA_ERROR != 0 {
            TransferState::Error
        } else if status & M2STAT_DATA_OVERRUN != 0 {
            TransferState::Overrun
        } else {
            TransferState::Unknown
        })
    }

    /// Samples of replay memory, or of one segment in sequence mode.
    pub fn set_memory_size(&self, samples: i32, sequence_segment: bool) -> Result<()> {
        let register = if sequence_segment {
            SPC_SEQMODE_SEGMENTSIZE
        } else {
            SPC_MEMSIZE
        };
        self.set(register, samples)
    }

    /// Samples of replay memory
    pub fn get_memory_size(&self) -> Result<i32> {
        self.get(SPC_MEMSIZE)
    }

    /// Segment size for multi and gate modes
    pub fn set_segment_size(&self, samples: i32) -> Result<()> {
        self.set(SPC_SEGMENTSIZE, samples)
    }

    /// Segment that the next upload goes to.
    pub fn set_current_segment(&self, index: i32) -> Result<()> {
        self.set(SPC_SEQMODE_WRITESEGMENT, index)
    }

    /// Switch to sequence mode with room for `steps` segments.
    pub fn init_sequence_mode(&self, steps: usize) -> Result<()> {
        if steps == 0 || steps > MAX_SEGMENTS {
            return Err(DaqError::InvalidArgument(format!(
                "sequence needs 1 to {} steps, got {}",
                MAX_SEGMENTS, steps
            ))
            .into());
        }
        let max_segments = steps.next_power_of_two();
        self.set_mode(CardMode::Sequence)?;
        self.set(SPC_SEQMODE_MAXSEGMENTS, max_segments as i32)?;
        self.set(SPC_SEQMODE_STARTSTEP, 0)
    }

    /// Write one entry of sequence memory.
    pub fn write_sequence_step(
        &self,
        step: usize,
        segment: usize,
        loops: u32,
        goto: usize,
        condition: StepCondition,
    ) -> Result<()> {
        let word = sequence_word(segment, goto, loops, condition);
        debug!(card = self.number, step, segment, loops, goto, ?condition, "Sequence step");
        self.device.set64(SPC_SEQMODE_STEPMEM0 + step as i32, word);
        self.check()
    }

    /// Bytes per sample
    pub fn get_bytes_per_sample(&self) -> Result<i32> {
        self.get(SPC_MIINST_BYTESPERSAMPLE)
    }

    /// Sample rate in Hz.
    pub fn set_samplerate(&self, rate: i32) -> Result<()> {
        self.set(SPC_SAMPLERATE, rate)
    }

    /// Sample rate in Hz
    pub fn get_samplerate(&self) -> Result<i32> {
        self.get(SPC_SAMPLERATE)
    }

    /// Enabled channels, one bit each.
    pub fn set_selected_channels(&self, channels: i32) -> Result<()> {
        self.set(SPC_CHENABLE, channels)
    }

    /// Enabled channels
    pub fn get_selected_channels(&self) -> Result<i32> {
        self.get(SPC_CHENABLE)
    }

    /// Number of enabled channels
    pub fn get_selected_channels_count(&self) -> Result<i32> {
        self.get(SPC_CHCOUNT)
    }

    /// Enable the output stage of `channel`.
    pub fn set_channel_output(&self, channel: usize, enabled: bool) -> Result<()> {
        self.set(SPC_ENABLEOUT0[channel & 3], i32::from(enabled))
    }

    /// Whether the output stage of `channel` is on
    pub fn get_channel_output(&self, channel: usize) -> Result<bool> {
        Ok(self.get(SPC_ENABLEOUT0[channel & 3])? != 0)
    }

    /// Amplitude in mV into 50 Ohm.
    pub fn set_amplitude(&self, channel: usize, millivolts: i32) -> Result<()> {
        self.set(SPC_AMP0[channel & 3], millivolts)
    }

    /// Amplitude in mV into 50 Ohm
    pub fn get_amplitude(&self, channel: usize) -> Result<i32> {
        self.get(SPC_AMP0[channel & 3])
    }

    /// Output filter selection.
    pub fn set_filter(&self, channel: usize, filter: i32) -> Result<()> {
        self.set(SPC_FILTER0[channel & 3], filter)
    }

    /// Output filter selection
    pub fn get_filter(&self, channel: usize) -> Result<i32> {
        self.get(SPC_FILTER0[channel & 3])
    }

    /// Offset in percent of the range (±100).
    pub fn set_offset(&self, channel: usize, percent: i32) -> Result<()> {
        self.set(SPC_OFFS0[channel & 3], percent)
    }

    /// Offset in percent
    pub fn get_offset(&self, channel: usize) -> Result<i32> {
        self.get(SPC_OFFS0[channel & 3])
    }

    /// Level held after the waveform ends.
    pub fn set_stoplevel(&self, channel: usize, level: StopLevel) -> Result<()> {
        self.set(SPC_CH0_STOPLEVEL[channel & 3], level.register_value())
    }

    /// Level held after the waveform ends
    pub fn get_stoplevel(&self, channel: usize) -> Result<Option<StopLevel>> {
        Ok(StopLevel::from_register(self.get(SPC_CH0_STOPLEVEL[channel & 3])?))
    }

    /// Replay mode.
    pub fn set_mode(&self, mode: CardMode) -> Result<()> {
        self.set(SPC_CARDMODE, mode.register_value())
    }

    /// Replay mode, `None` when the register holds something else
    pub fn get_mode(&self) -> Result<Option<CardMode>> {
        Ok(CardMode::from_register(self.get(SPC_CARDMODE)?))
    }

    /// Transfer `samples` samples of `data` to card memory.
    ///
    /// Unless `buffered`, the memory (or segment) size is set to the padded
    /// length first. With `block` the call returns after the DMA finished.
    pub fn upload(
        &self,
        samples: usize,
        data: &CardData,
        buffered: bool,
        mem_offset: u64,
        block: bool,
        sequence_segment: bool,
    ) -> Result<()> {
        let used = self.get_selected_channels_count()?.max(1) as usize;
        let bytes_per_sample = self.get_bytes_per_sample()? as u64;
        let padded = padded_len(samples, sequence_segment);
        if !buffered {
            self.set_memory_size(padded as i32, sequence_segment)?;
        }

        let mut buffer = interleave(samples, used, data, self.markers_enabled());
        buffer.resize(padded * used, 0);
        let offset = mem_offset * used as u64 * bytes_per_sample;
        self.device.def_transfer(offset, &buffer);

        let cmd = if block {
            M2CMD_DATA_STARTDMA | M2CMD_DATA_WAITDMA
        } else {
            M2CMD_DATA_STARTDMA
        };
        debug!(card = self.number, samples, padded, used, "Uploading");
        self.command(cmd)
    }

    /// Release the driver handle
    pub fn close(&self) {
        self.device.close()
    }
}

/// Sequence memory word: segment, next step, loops and end condition.
pub fn sequence_word(segment: usize, goto: usize, loops: u32, condition: StepCondition) -> i64 {
    segment as i64 | (goto as i64) << 16 | i64::from(loops) << 32 | condition.register_value() << 32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::awg::device::SimulatedCard;

    fn card() -> (Card, Arc<SimulatedCard>) {
        let sim = Arc::new(SimulatedCard::new(1234));
        (Card::new(0, sim.clone()), sim)
    }

    #[test]
    fn padding_rules() {
        assert_eq!(padded_len(1, false), 32);
        assert_eq!(padded_len(64, false), 64);
        assert_eq!(padded_len(65, false), 96);
        assert_eq!(padded_len(10, true), 192);
        assert_eq!(padded_len(200, true), 224);
    }

    #[test]
    fn markers_fold_into_msbs() {
        let data = CardData {
            ch0: vec![400, -5],
            ch1: vec![800, 8],
            markers: [vec![true, false], vec![true, false], vec![false, true]],
        };
        let buffer = interleave(2, 2, &data, true);
        assert_eq!(buffer[0], 100 + (1 << 14));
        assert_eq!(buffer[1], (200 - 32768) as i16);
        assert_eq!(buffer[2], -2);
        assert_eq!(buffer[3], 2 + (1 << 14));
    }

    #[test]
    fn analog_passes_through_without_markers() {
        let data = CardData {
            ch0: vec![1000],
            ch1: vec![-1000],
            ..Default::default()
        };
        assert_eq!(&interleave(1, 2, &data, false)[..2], &[1000, -1000]);
    }

    #[test]
    fn sequence_words() {
        assert_eq!(sequence_word(3, 4, 0, StepCondition::Always), 3 | 4 << 16);
        assert_eq!(
            sequence_word(0, 1, 5, StepCondition::OnTrigger),
            (1 << 16) | (5i64 << 32) | (0x4000_0000i64 << 32)
        );
    }

    #[test]
    fn upload_sets_memory_and_starts_dma() {
        let (card, sim) = card();
        card.set_selected_channels(0b11).unwrap();
        let data = CardData {
            ch0: vec![1; 40],
            ch1: vec![2; 40],
            ..Default::default()
        };
        card.upload(40, &data, false, 0, true, false).unwrap();
        assert_eq!(sim.register(SPC_MEMSIZE), 64);
        let transfer = &sim.transfers()[0];
        assert_eq!(transfer.samples.len(), 128);
        assert_eq!(
            sim.commands().last().copied(),
            Some(M2CMD_DATA_STARTDMA | M2CMD_DATA_WAITDMA)
        );
        assert_eq!(card.get_datatransfer_state().unwrap(), TransferState::Finished);
    }

    #[test]
    fn sequence_mode_rounds_segments() {
        let (card, sim) = card();
        card.init_sequence_mode(5).unwrap();
        assert_eq!(sim.register(SPC_SEQMODE_MAXSEGMENTS), 8);
        assert_eq!(card.get_mode().unwrap(), Some(CardMode::Sequence));
        assert!(card.init_sequence_mode(MAX_SEGMENTS + 1).is_err());
    }

    #[test]
    fn reported_errors_surface() {
        let (card, sim) = card();
        sim.inject_error("invalid register value");
        assert!(card.set_loops(1).is_err());
        assert!(card.set_loops(1).is_ok());
    }

    #[test]
    fn getters_decode_registers() {
        let (card, _) = card();
        card.set_stoplevel(1, StopLevel::Hold).unwrap();
        assert_eq!(card.get_stoplevel(1).unwrap(), Some(StopLevel::Hold));
        card.set_trigger_mode(0, TriggerMode::NegEdge).unwrap();
        assert_eq!(card.get_trigger_mode(0).unwrap(), Some(TriggerMode::NegEdge));
        card.set_trigger_ormask(false, true).unwrap();
        assert!(!card.get_trigger_in_ormask(0).unwrap());
        assert!(card.get_trigger_in_ormask(1).unwrap());
        assert_eq!(card.get_serial().unwrap(), 1234);
        assert_eq!("fifo_gate".parse::<CardMode>().unwrap(), CardMode::FifoGate);
    }
}
