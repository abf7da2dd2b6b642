//! Setup configuration, read from a TOML file.
//!
//! Every section and every key is optional; anything left out takes the lab default.
//!
//! ```toml
//! [sequencer]
//! board = 0              # only needed with several boards
//! core_clock_mhz = 500.0
//!
//! [channels]             # name = 24-character bit string, MSB first
//! green = "111000000000000000000001"
//! detect = "111000000000000000000010"
//! mw2 = "111000000000000000000100"
//! mw1 = "111000000000000000001000"
//!
//! [counter]
//! pulse_chan = "Dev1/ctr1"
//! count_chan = "Dev1/ctr0"
//! photon_chan = "Dev1/ctr0"
//! gate_terminal = "PFI38"
//! gate_chan = "Dev1/ctr3"
//! gate_pause_when = "low"
//! timeout_s = 10.0
//!
//! [rabi]
//! det_ns = 400
//! off_ns = 3000
//! green_ns = 5000
//! duty_ns = 5000
//! wait_ns = 0
//! loop_num = 1000000
//! microwave = "mw1"
//! encoding = "with_green"
//! repeats = 1
//! ```

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use pbcompiler_backend::*;

use crate::counter::{check_counter_chan, duration_from_secs};
use crate::device::PausePolarity;
use crate::error::{CtrlError, CtrlResult};
use crate::gated::GatedChannels;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExpConfig {
    #[serde(default)]
    pub sequencer: SequencerConfig,

    /// Output channels by name.
    #[serde(default = "default_channels")]
    pub channels: IndexMap<String, String>,

    #[serde(default)]
    pub counter: CounterConfig,

    #[serde(default)]
    pub rabi: RabiConfig,
}

impl Default for ExpConfig {
    fn default() -> Self {
        ExpConfig {
            sequencer: SequencerConfig::default(),
            channels: default_channels(),
            counter: CounterConfig::default(),
            rabi: RabiConfig::default(),
        }
    }
}

fn default_channels() -> IndexMap<String, String> {
    ChannelMap::odmr_default()
        .iter()
        .map(|(name, mask)| {
            let with_flags = ChannelMask::from_bits(mask.output_word());
            (name.to_string(), with_flags.to_bit_str())
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SequencerConfig {
    /// Board to select when more than one is installed.
    #[serde(default)]
    pub board: Option<i32>,

    #[serde(default = "default_core_clock")]
    pub core_clock_mhz: f64,
}

fn default_core_clock() -> f64 {
    500.0
}

impl Default for SequencerConfig {
    fn default() -> Self {
        SequencerConfig {
            board: None,
            core_clock_mhz: default_core_clock(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CounterConfig {
    pub pulse_chan: String,
    pub count_chan: String,
    pub photon_chan: String,
    pub gate_terminal: String,
    pub gate_chan: String,
    pub gate_pause_when: PausePolarity,
    pub timeout_s: f64,
}

impl Default for CounterConfig {
    fn default() -> Self {
        let gated = GatedChannels::default();
        CounterConfig {
            pulse_chan: crate::counter::DEFAULT_PULSE_CHAN.to_string(),
            count_chan: crate::counter::DEFAULT_COUNT_CHAN.to_string(),
            photon_chan: gated.photon_chan,
            gate_terminal: gated.gate_terminal,
            gate_chan: gated.gate_chan,
            gate_pause_when: gated.pause_when,
            timeout_s: crate::counter::DEFAULT_TIMEOUT.as_secs_f64(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncodingSetting {
    WithGreen,
    Bare,
}

impl From<EncodingSetting> for MicrowaveEncoding {
    fn from(setting: EncodingSetting) -> Self {
        match setting {
            EncodingSetting::WithGreen => MicrowaveEncoding::WithGreen,
            EncodingSetting::Bare => MicrowaveEncoding::Bare,
        }
    }
}

/// Rabi timing defaults; the microwave width itself is given per scan point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RabiConfig {
    pub det_ns: u64,
    pub off_ns: u64,
    pub green_ns: u64,
    pub duty_ns: u64,
    pub wait_ns: u64,
    pub loop_num: u32,
    /// Channel name of the microwave switch.
    pub microwave: String,
    pub encoding: EncodingSetting,
    pub repeats: usize,
}

impl Default for RabiConfig {
    fn default() -> Self {
        let timing = RabiTiming::default();
        RabiConfig {
            det_ns: timing.det_ns,
            off_ns: timing.off_ns,
            green_ns: timing.green_ns,
            duty_ns: timing.duty_ns,
            wait_ns: timing.wait_ns,
            loop_num: timing.loop_num,
            microwave: "mw1".to_string(),
            encoding: EncodingSetting::WithGreen,
            repeats: 1,
        }
    }
}

impl ExpConfig {
    /// Reads and validates the configuration at `path`.
    pub fn load<P: AsRef<Path>>(path: P) -> CtrlResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> CtrlResult<Self> {
        let config: ExpConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> CtrlResult<String> {
        toml::to_string(self).map_err(|e| CtrlError::Config(e.to_string()))
    }

    /// Checks what can be checked without hardware: bit strings, channel names, counter
    /// identifiers and timing.
    pub fn validate(&self) -> CtrlResult<()> {
        if self.sequencer.core_clock_mhz <= 0.0 {
            return Err(CtrlError::Config(format!(
                "Core clock must be positive, got {} MHz",
                self.sequencer.core_clock_mhz
            )));
        }
        self.rabi_channels()?;
        for chan in [
            &self.counter.pulse_chan,
            &self.counter.count_chan,
            &self.counter.photon_chan,
            &self.counter.gate_chan,
        ] {
            check_counter_chan(chan)?;
        }
        self.counter_timeout()?;
        if self.rabi.repeats == 0 {
            return Err(CtrlError::Config("rabi.repeats must be at least 1".to_string()));
        }
        check_loop_count(self.rabi.loop_num)?;
        Ok(())
    }

    pub fn channel_map(&self) -> CtrlResult<ChannelMap> {
        Ok(ChannelMap::from_bit_strings(
            self.channels
                .iter()
                .map(|(name, bits)| (name.as_str(), bits.as_str())),
        )?)
    }

    pub fn rabi_channels(&self) -> CtrlResult<RabiChannels> {
        Ok(RabiChannels::from_map(&self.channel_map()?, &self.rabi.microwave)?)
    }

    /// Configured timing with microwave width `mw_ns`.
    pub fn rabi_timing(&self, mw_ns: u64) -> RabiTiming {
        RabiTiming {
            mw_ns,
            det_ns: self.rabi.det_ns,
            off_ns: self.rabi.off_ns,
            green_ns: self.rabi.green_ns,
            duty_ns: self.rabi.duty_ns,
            wait_ns: self.rabi.wait_ns,
            loop_num: self.rabi.loop_num,
        }
    }

    pub fn encoding(&self) -> MicrowaveEncoding {
        self.rabi.encoding.into()
    }

    pub fn gated_channels(&self) -> GatedChannels {
        GatedChannels {
            photon_chan: self.counter.photon_chan.clone(),
            gate_terminal: self.counter.gate_terminal.clone(),
            gate_chan: self.counter.gate_chan.clone(),
            pause_when: self.counter.gate_pause_when,
        }
    }

    pub fn counter_timeout(&self) -> CtrlResult<Duration> {
        duration_from_secs("Counter timeout", self.counter.timeout_s)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn empty_file_gives_lab_defaults() {
        let config = ExpConfig::from_toml_str("").unwrap();
        assert_eq!(config, ExpConfig::default());
        assert_eq!(config.sequencer.core_clock_mhz, 500.0);
        assert_eq!(config.rabi_timing(15), RabiTiming::with_mw_ns(15));
        let channels = config.rabi_channels().unwrap();
        assert_eq!(
            channels.microwave.output_word(),
            RabiChannels::default().microwave.output_word()
        );
        assert_eq!(config.channels["mw1"], "111000000000000000001000");
        assert_eq!(config.gated_channels(), GatedChannels::default());
        assert_eq!(config.counter_timeout().unwrap(), Duration::from_secs(10));
    }

    #[test]
    fn partial_sections() {
        let config = ExpConfig::from_toml_str(
            r#"
            [sequencer]
            board = 1

            [rabi]
            wait_ns = 100
            microwave = "mw2"
            encoding = "bare"
            "#,
        )
        .unwrap();
        assert_eq!(config.sequencer.board, Some(1));
        assert_eq!(config.rabi.duty_ns, 5000);
        assert_eq!(config.encoding(), MicrowaveEncoding::Bare);
        assert_eq!(
            config.rabi_channels().unwrap().microwave.output_word(),
            ChannelMask::line(2).output_word()
        );
    }

    #[test]
    fn toml_round_trip() {
        let mut config = ExpConfig::default();
        config.sequencer.board = Some(0);
        config.rabi.loop_num = 5000;
        config.counter.gate_pause_when = PausePolarity::High;
        let text = config.to_toml_string().unwrap();
        assert_eq!(ExpConfig::from_toml_str(&text).unwrap(), config);
    }

    #[test]
    fn invalid_settings() {
        let bad_bits = ExpConfig::from_toml_str("[channels]\ngreen = \"101\"\n");
        assert!(matches!(bad_bits, Err(CtrlError::Compile(_))));

        // Channels replace the defaults as a whole, so mw1 is missing here
        let missing = ExpConfig::from_toml_str(
            "[channels]\ngreen = \"111000000000000000000001\"\ndetect = \"111000000000000000000010\"\n",
        );
        assert!(missing.unwrap_err().is_validation());

        let bad_chan = ExpConfig::from_toml_str("[counter]\ngate_chan = \"PFI38\"\n");
        assert!(matches!(bad_chan, Err(CtrlError::Config(_))));

        let typo = ExpConfig::from_toml_str("[rabi]\nloopnum = 10\n");
        assert!(matches!(typo, Err(CtrlError::ConfigParse(_))));

        let endless = ExpConfig::from_toml_str("[counter]\ntimeout_s = 1e30\n");
        assert!(matches!(endless, Err(CtrlError::Config(_))));

        let too_many = ExpConfig::from_toml_str("[rabi]\nloop_num = 2000000\n");
        assert!(too_many.unwrap_err().is_validation());
    }
}
