//! Spectrum arbitrary waveform generator: two M4i cards behind a star-hub.
//!
//! The four analog channels are numbered across cards: channels 0 and 1 live
//! on card 0, channels 2 and 3 on card 1. Each card also carries three marker
//! lines folded into the sample MSBs.
//!
//! Waveform data is addressed by a flat index over ten lanes:
//!
//! | Lane | Signal            |
//! |------|-------------------|
//! | 0-3  | analog ch0..ch3   |
//! | 4-6  | card 0 markers    |
//! | 7-9  | card 1 markers    |
//!
//! Register access goes through [`device::SpcmDevice`]; without the vendor
//! driver the module runs on [`device::SimulatedCard`] handles.

pub mod card;
pub mod device;
pub mod hub;
pub mod regs;

use crate::error::DaqError;
use crate::module::{Module, ModuleState, StateCell};
use anyhow::Result;
use async_trait::async_trait;
use card::{Card, CardData, CardMode, StepCondition, TriggerMode};
use device::{SimulatedCard, SimulatedHub, SpcmDevice};
use hub::Hub;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info};

/// Lanes of a [`Waveform`].
pub const LANES: usize = 10;
/// Sample value of an analog lane that is switched on.
pub const ANALOG_HIGH: i16 = i16::MAX;

/// Settings for [`Awg`].
#[derive(Debug, Clone, Deserialize)]
pub struct AwgConfig {
    /// Address of the card chassis
    #[serde(default)]
    pub ip: String,
    /// Card numbers, card 0 first
    #[serde(default = "default_cards")]
    pub card_ids: Vec<i32>,
    /// Star-hub number
    #[serde(default)]
    pub hub_id: i32,
    /// Sample rate in Hz
    #[serde(default = "default_rate")]
    pub sample_rate: i32,
    /// Fold markers into the sample MSBs
    #[serde(default = "default_true")]
    pub markers: bool,
    /// Use simulated cards
    #[serde(default)]
    pub simulate: bool,
}

fn default_cards() -> Vec<i32> {
    vec![0, 1]
}

fn default_rate() -> i32 {
    1_250_000_000
}

fn default_true() -> bool {
    true
}

impl Default for AwgConfig {
    fn default() -> Self {
        Self {
            ip: String::new(),
            card_ids: default_cards(),
            hub_id: 0,
            sample_rate: default_rate(),
            markers: true,
            simulate: false,
        }
    }
}

/// Samples for all ten lanes. Short lanes are zero padded.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Waveform {
    /// Analog channels 0..3
    pub analog: [Vec<i16>; 4],
    /// Markers, card 0 first
    pub markers: [Vec<bool>; 6],
}

impl Waveform {
    /// Longest lane
    pub fn len(&self) -> usize {
        let analog = self.analog.iter().map(Vec::len).max().unwrap_or(0);
        let markers = self.markers.iter().map(Vec::len).max().unwrap_or(0);
        analog.max(markers)
    }

    /// Whether every lane is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Card 0 takes lanes 0, 1, 4, 5, 6; card 1 takes 2, 3, 7, 8, 9.
    pub fn split(self) -> (CardData, CardData) {
        let [a0, a1, a2, a3] = self.analog;
        let [m0, m1, m2, m3, m4, m5] = self.markers;
        (
            CardData {
                ch0: a0,
                ch1: a1,
                markers: [m0, m1, m2],
            },
            CardData {
                ch0: a2,
                ch1: a3,
                markers: [m3, m4, m5],
            },
        )
    }
}

/// A block of samples during which the listed lanes are high.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pulse {
    /// Lanes switched on (0..10)
    pub lanes: Vec<usize>,
    /// Length in samples
    pub samples: usize,
}

/// Concatenate pulses into one waveform.
pub fn render(pulses: &[Pulse]) -> Result<Waveform> {
    let mut wave = Waveform::default();
    for pulse in pulses {
        if let Some(bad) = pulse.lanes.iter().find(|l| **l >= LANES) {
            return Err(DaqError::InvalidArgument(format!("no lane {}", bad)).into());
        }
        for (lane, samples) in wave.analog.iter_mut().enumerate() {
            let level = if pulse.lanes.contains(&lane) { ANALOG_HIGH } else { 0 };
            samples.extend(std::iter::repeat(level).take(pulse.samples));
        }
        for (i, samples) in wave.markers.iter_mut().enumerate() {
            let on = pulse.lanes.contains(&(i + 4));
            samples.extend(std::iter::repeat(on).take(pulse.samples));
        }
    }
    Ok(wave)
}

/// Append a pulse on `fill_lanes` so the total length is a multiple of
/// `clocking` samples.
pub fn fill_sequence(pulses: &mut Vec<Pulse>, clocking: usize, fill_lanes: &[usize]) {
    if clocking == 0 {
        return;
    }
    let total: usize = pulses.iter().map(|p| p.samples).sum();
    let remainder = total % clocking;
    if remainder != 0 {
        pulses.push(Pulse {
            lanes: fill_lanes.to_vec(),
            samples: clocking - remainder,
        });
    }
}

/// Identification and setup summary.
#[derive(Debug, Clone, Serialize)]
pub struct AwgInfo {
    /// Serial number per card
    pub card_serials: Vec<i32>,
    /// Card numbers in hub slot order
    pub hub_cards: Vec<i32>,
    /// Sample rate in Hz
    pub sample_rate: i32,
    /// Replay mode of card 0
    pub mode: Option<String>,
}

/// Two-card AWG.
pub struct Awg {
    name: String,
    config: AwgConfig,
    cards: Vec<Card>,
    hub: Hub,
    uploading: AtomicBool,
    state: StateCell,
}

impl Awg {
    /// AWG on already opened handles, card 0 first.
    pub fn new(
        name: &str,
        config: AwgConfig,
        cards: Vec<Arc<dyn SpcmDevice>>,
        hub: Arc<dyn SpcmDevice>,
    ) -> Result<Self> {
        if cards.len() != 2 || config.card_ids.len() != 2 {
            return Err(DaqError::Configuration(format!(
                "{}: exactly two cards are supported, got {}",
                name,
                cards.len()
            ))
            .into());
        }
        let cards = config
            .card_ids
            .iter()
            .zip(cards)
            .map(|(number, device)| Card::new(*number, device))
            .collect();
        let hub = Hub::new(config.hub_id, hub);
        Ok(Self {
            name: name.to_string(),
            config,
            cards,
            hub,
            uploading: AtomicBool::new(false),
            state: StateCell::new(),
        })
    }

    /// Open the configured cards.
    pub fn from_config(name: &str, config: AwgConfig) -> Result<Self> {
        if !config.simulate {
            return Err(DaqError::FeatureNotEnabled(format!(
                "{}: no Spectrum driver library for {}; set simulate = true",
                name, config.ip
            ))
            .into());
        }
        let cards: Vec<Arc<dyn SpcmDevice>> = config
            .card_ids
            .iter()
            .map(|id| Arc::new(SimulatedCard::new(10_000 + id)) as Arc<dyn SpcmDevice>)
            .collect();
        let hub = Arc::new(SimulatedHub::new(&config.card_ids));
        Self::new(name, config, cards, hub)
    }

    /// Card `index` (0 or 1).
    pub fn card(&self, index: usize) -> Option<&Card> {
        self.cards.get(index)
    }

    /// The star-hub
    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    /// Whether an upload is in progress
    pub fn is_uploading(&self) -> bool {
        self.uploading.load(Ordering::SeqCst)
    }

    fn each(&self, f: impl Fn(&Card) -> Result<()>) -> Result<()> {
        self.cards.iter().try_for_each(f)
    }

    /// Clock from the internal PLL on every card.
    pub fn set_external_clock_input(&self) -> Result<()> {
        self.each(Card::use_internal_pll)
    }

    /// Default channel setup: all four channels on, cards synced, continuous
    /// loops, configured sample rate, single mode.
    pub fn init_all_channels(&self) -> Result<()> {
        self.set_selected_channels(0b1111)?;
        self.set_output(0b1111)?;
        self.hub.sync_all_cards()?;
        self.set_loops(0)?;
        self.set_samplerate(self.config.sample_rate)?;
        self.set_mode(CardMode::Single)
    }

    /// External trigger on both inputs: rising edge at 1.3 V, 50 Ohm.
    pub fn init_ext_trigger(&self) -> Result<()> {
        let (c0, c1) = (&self.cards[0], &self.cards[1]);
        c1.set_trigger_mode(0, TriggerMode::PosEdge)?;
        c1.set_trigger_mode(1, TriggerMode::PosEdge)?;
        c1.set_trigger_level0(0, 1300)?;
        c1.set_trigger_level0(1, 1300)?;
        c0.set_trigger_ormask(false, false)?;
        c1.set_trigger_ormask(true, true)?;
        c0.set_trigger_termination(true)?;
        c1.set_trigger_termination(true)
    }

    /// Enable channels, one bit per channel across both cards.
    pub fn set_selected_channels(&self, channels: u8) -> Result<()> {
        self.cards[0].set_selected_channels(i32::from(channels & 0b11))?;
        self.cards[1].set_selected_channels(i32::from((channels >> 2) & 0b11))
    }

    /// Switch output stages, one bit per channel across both cards.
    pub fn set_output(&self, channels: u8) -> Result<()> {
        self.cards[0].set_channel_output(0, channels & 0b0001 != 0)?;
        self.cards[0].set_channel_output(1, channels & 0b0010 != 0)?;
        self.cards[1].set_channel_output(0, channels & 0b0100 != 0)?;
        self.cards[1].set_channel_output(1, channels & 0b1000 != 0)
    }

    /// Sample rate on both cards
    pub fn set_samplerate(&self, rate: i32) -> Result<()> {
        self.each(|c| c.set_samplerate(rate))
    }

    /// Sample rate read from card 1
    pub fn get_samplerate(&self) -> Result<i32> {
        self.cards[1].get_samplerate()
    }

    /// Loops on both cards
    pub fn set_loops(&self, loops: i32) -> Result<()> {
        self.each(|c| c.set_loops(loops))
    }

    /// Replay mode on both cards
    pub fn set_mode(&self, mode: CardMode) -> Result<()> {
        self.each(|c| c.set_mode(mode))
    }

    /// Segment size on both cards
    pub fn set_segment_size(&self, samples: i32) -> Result<()> {
        self.each(|c| c.set_segment_size(samples))
    }

    /// Memory or segment size on both cards
    pub fn set_memory_size(&self, samples: i32, sequence_segment: bool) -> Result<()> {
        self.each(|c| c.set_memory_size(samples, sequence_segment))
    }

    /// Start with a forced first trigger.
    pub fn start(&self) -> Result<()> {
        self.hub.start_triggered()
    }

    /// Start and wait for an external trigger
    pub fn start_enable_trigger(&self) -> Result<()> {
        self.hub.start_enable_trigger()
    }

    /// Stop replay
    pub fn stop(&self) -> Result<()> {
        self.hub.stop()
    }

    /// Reset all cards
    pub fn reset(&self) -> Result<()> {
        self.hub.reset()
    }

    /// Write settings without starting
    pub fn write_setup(&self) -> Result<()> {
        self.hub.write_setup()
    }

    /// Let triggers take effect
    pub fn enable_trigger(&self) -> Result<()> {
        self.hub.enable_trigger()
    }

    /// Force one trigger
    pub fn force_trigger(&self) -> Result<()> {
        self.hub.force_trigger()
    }

    /// Ignore triggers
    pub fn disable_trigger(&self) -> Result<()> {
        self.hub.disable_trigger()
    }

    /// Block until the next trigger
    pub fn wait_trigger(&self) -> Result<()> {
        self.hub.wait_trigger()
    }

    /// Block until the run completed
    pub fn wait_ready(&self) -> Result<()> {
        self.hub.wait_ready()
    }

    /// Upload to both cards at once and wait for both DMAs.
    pub async fn upload(
        &self,
        wave: Waveform,
        mem_offset: u64,
        buffered: bool,
        sequence_segment: bool,
    ) -> Result<()> {
        self.uploading.store(true, Ordering::SeqCst);
        let samples = wave.len();
        let (data0, data1) = wave.split();

        let tasks = [(self.cards[0].clone(), data0), (self.cards[1].clone(), data1)].map(
            |(card, data)| {
                tokio::task::spawn_blocking(move || {
                    let result = card.upload(samples, &data, buffered, mem_offset, true, sequence_segment);
                    (card.number(), result)
                })
            },
        );
        let [first, second] = tasks;
        let (first, second) = tokio::join!(first, second);
        self.uploading.store(false, Ordering::SeqCst);

        let mut failure = None;
        for joined in [first, second] {
            let (number, result) = joined.map_err(|e| DaqError::Instrument(format!("upload task: {}", e)))?;
            if let Err(e) = result {
                error!(awg = %self.name, card = number, error = %e, "Upload failed");
                failure.get_or_insert(e);
            }
        }
        failure.map_or(Ok(()), Err)
    }

    /// Render `pulses`, pad them to `clocking` samples, upload and start.
    pub async fn run_sequence(
        &self,
        mut pulses: Vec<Pulse>,
        clocking: usize,
        fill_lanes: &[usize],
    ) -> Result<()> {
        fill_sequence(&mut pulses, clocking, fill_lanes);
        let wave = render(&pulses)?;
        self.upload(wave, 0, false, false).await?;
        self.start()
    }

    /// Upload one segment per step and chain the steps in a loop: step i
    /// goes to i+1, the last one back to 0.
    pub async fn run_in_sequence_mode(&self, steps: Vec<(Vec<Pulse>, u32)>) -> Result<()> {
        self.stop()?;
        let count = steps.len();
        self.each(|c| c.init_sequence_mode(count))?;
        for (i, (pulses, loops)) in steps.into_iter().enumerate() {
            self.each(|c| c.set_current_segment(i as i32))?;
            self.upload(render(&pulses)?, 0, false, true).await?;
            let goto = if i + 1 == count { 0 } else { i + 1 };
            self.each(|c| c.write_sequence_step(i, i, loops, goto, StepCondition::Always))?;
        }
        info!(awg = %self.name, steps = count, "Sequence loaded");
        self.start()
    }

    /// Serials and current setup.
    pub fn info(&self) -> Result<AwgInfo> {
        Ok(AwgInfo {
            card_serials: self
                .cards
                .iter()
                .map(Card::get_serial)
                .collect::<Result<_>>()?,
            hub_cards: self.hub.card_indices()?,
            sample_rate: self.get_samplerate()?,
            mode: self.cards[0].get_mode()?.map(|m| m.name().to_string()),
        })
    }

    /// Release all handles
    pub fn close(&self) {
        for card in &self.cards {
            card.close();
        }
        self.hub.close();
    }
}

#[async_trait]
impl Module for Awg {
    fn name(&self) -> &str {
        &self.name
    }

    async fn on_activate(&self) -> Result<()> {
        self.set_external_clock_input()?;
        let markers = self.config.markers;
        self.each(|c| c.init_markers(markers))?;
        self.init_all_channels()?;
        info!(awg = %self.name, "AWG initialised");
        self.state.set(ModuleState::Idle);
        Ok(())
    }

    async fn on_deactivate(&self) -> Result<()> {
        if let Err(e) = self.stop() {
            error!(awg = %self.name, error = %e, "Stop on deactivate failed");
        }
        self.close();
        self.state.set(ModuleState::Deactivated);
        Ok(())
    }

    fn state(&self) -> ModuleState {
        self.state.get()
    }
}

#[cfg(test)]
mod tests {
    use super::regs::*;
    use super::*;

    struct Rig {
        awg: Awg,
        cards: [Arc<SimulatedCard>; 2],
        hub: Arc<SimulatedHub>,
    }

    async fn rig() -> Rig {
        let cards = [Arc::new(SimulatedCard::new(11)), Arc::new(SimulatedCard::new(12))];
        let hub = Arc::new(SimulatedHub::new(&[0, 1]));
        let awg = Awg::new(
            "awg",
            AwgConfig::default(),
            cards.iter().map(|c| c.clone() as Arc<dyn SpcmDevice>).collect(),
            hub.clone(),
        )
        .unwrap();
        awg.on_activate().await.unwrap();
        Rig { awg, cards, hub }
    }

    #[tokio::test]
    async fn activation_configures_both_cards() {
        let rig = rig().await;
        for card in &rig.cards {
            assert_eq!(card.register(SPC_CLOCKMODE), i64::from(SPC_CM_INTPLL));
            assert_eq!(card.register(SPC_CHENABLE), 0b11);
            assert_eq!(card.register(SPC_ENABLEOUT0[1]), 1);
            assert_eq!(card.register(SPC_SAMPLERATE), 1_250_000_000);
            assert_eq!(card.register(SPC_CARDMODE), i64::from(SPC_REP_STD_SINGLE));
        }
        assert_eq!(rig.hub.register(SPC_SYNC_ENABLEMASK), 0b11);
        let info = rig.awg.info().unwrap();
        assert_eq!(info.card_serials, vec![11, 12]);
        assert_eq!(info.mode.as_deref(), Some("single"));
    }

    #[tokio::test]
    async fn channel_bits_route_to_cards() {
        let rig = rig().await;
        rig.awg.set_selected_channels(0b0110).unwrap();
        assert_eq!(rig.cards[0].register(SPC_CHENABLE), 0b10);
        assert_eq!(rig.cards[1].register(SPC_CHENABLE), 0b01);
    }

    #[test]
    fn fill_pads_to_clock() {
        let mut pulses = vec![Pulse {
            lanes: vec![4],
            samples: 100,
        }];
        fill_sequence(&mut pulses, 64, &[]);
        assert_eq!(pulses[1].samples, 28);
        fill_sequence(&mut pulses, 64, &[]);
        assert_eq!(pulses.len(), 2);
    }

    #[test]
    fn split_assigns_lanes() {
        let wave = render(&[Pulse {
            lanes: vec![2, 4, 9],
            samples: 3,
        }])
        .unwrap();
        let (c0, c1) = wave.split();
        assert_eq!(c0.ch0, vec![0; 3]);
        assert_eq!(c1.ch0, vec![ANALOG_HIGH; 3]);
        assert_eq!(c0.markers[0], vec![true; 3]);
        assert_eq!(c1.markers[2], vec![true; 3]);
        assert!(render(&[Pulse {
            lanes: vec![10],
            samples: 1
        }])
        .is_err());
    }

    #[tokio::test]
    async fn run_sequence_uploads_both_cards_and_starts() {
        let rig = rig().await;
        let pulses = vec![Pulse {
            lanes: vec![0, 2],
            samples: 50,
        }];
        rig.awg.run_sequence(pulses, 0, &[]).await.unwrap();
        for card in &rig.cards {
            assert_eq!(card.transfers().len(), 1);
            assert_eq!(card.register(SPC_MEMSIZE), 64);
        }
        assert_eq!(
            rig.hub.commands().last().copied(),
            Some(M2CMD_CARD_START | M2CMD_CARD_ENABLETRIGGER | M2CMD_CARD_FORCETRIGGER)
        );
        assert!(!rig.awg.is_uploading());
    }

    #[tokio::test]
    async fn sequence_mode_chains_steps() {
        let rig = rig().await;
        let step = |n| {
            (
                vec![Pulse {
                    lanes: vec![4],
                    samples: n,
                }],
                2,
            )
        };
        rig.awg
            .run_in_sequence_mode(vec![step(10), step(20), step(300)])
            .await
            .unwrap();

        let card = &rig.cards[0];
        assert_eq!(card.register(SPC_SEQMODE_MAXSEGMENTS), 4);
        assert_eq!(card.register(SPC_SEQMODE_SEGMENTSIZE), 320);
        assert_eq!(
            card.register(SPC_SEQMODE_STEPMEM0 + 2),
            card::sequence_word(2, 0, 2, StepCondition::Always)
        );
        assert_eq!(
            card.register(SPC_SEQMODE_STEPMEM0),
            card::sequence_word(0, 1, 2, StepCondition::Always)
        );
        assert_eq!(card.transfers().len(), 3);
    }

    #[tokio::test]
    async fn card_error_fails_upload() {
        let rig = rig().await;
        rig.cards[1].inject_error("DMA overrun");
        let result = rig
            .awg
            .upload(render(&[Pulse { lanes: vec![], samples: 32 }]).unwrap(), 0, false, false)
            .await;
        assert!(result.is_err());
    }

    #[test]
    fn requires_simulation_without_driver() {
        assert!(Awg::from_config("awg", AwgConfig::default()).is_err());
        let config = AwgConfig {
            simulate: true,
            ..Default::default()
        };
        assert!(Awg::from_config("awg", config).is_ok());
    }
}
