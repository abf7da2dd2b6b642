//! Output channels of the pulse sequencer. See [`ChannelMask`] and [`ChannelMap`].
//!
//! A PulseBlaster drives 24 digital outputs. Every instruction carries one 24-bit word in
//! which bit `i` sets output `i`. Physical lines (the green AOM, the microwave switches,
//! the detection gate going to the counter card) are therefore combined with a bitwise OR:
//!
//! ```
//! use pbcompiler_backend::channel::*;
//!
//! let green = ChannelMask::line(0);
//! let detect = ChannelMask::line(1);
//! assert_eq!((green | detect).bits(), 0b11);
//! ```
//!
//! ## Idle flags
//! The three most significant bits do not address user channels. On the boards in use they
//! enable the output drivers and must stay high on every instruction, so they are OR-ed in
//! when the word is handed to the device ([`ChannelMask::output_word`]) instead of being
//! carried by each channel definition.
//!
//! ## Bit strings
//! Channel definitions are written as 24-character binary strings, most significant bit
//! first, the same way they appear on the wiring sheet (e.g. `"111000000000000000001000"`
//! for the first microwave switch). [`ChannelMask::from_bit_str`] rejects strings of the
//! wrong width or with characters other than `0` and `1`.

use indexmap::IndexMap;
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use crate::error::{CompileError, CompileResult};

/// Number of outputs on the sequencer.
pub const CHANNEL_WIDTH: usize = 24;

/// Output-enable bits that are held high on every instruction.
pub const IDLE_FLAGS: u32 = 0b111 << 21;

const WIDTH_MASK: u32 = (1 << CHANNEL_WIDTH) - 1;

static BINARY: Lazy<Result<Regex, regex::Error>> = Lazy::new(|| Regex::new(r"^[01]+$"));

/// A set of sequencer outputs, one bit per output line.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct ChannelMask(u32);

impl ChannelMask {
    /// All outputs low (apart from the idle flags, which are added on output).
    pub const NONE: ChannelMask = ChannelMask(0);

    /// Builds a mask from raw bits. Bits above [`CHANNEL_WIDTH`] are discarded.
    pub fn from_bits(bits: u32) -> Self {
        ChannelMask(bits & WIDTH_MASK)
    }

    /// Mask with only output `line` set.
    ///
    /// # Panics
    /// Panics if `line` is not below [`CHANNEL_WIDTH`].
    pub fn line(line: usize) -> Self {
        assert!(
            line < CHANNEL_WIDTH,
            "Output line {} does not exist on a {}-channel sequencer",
            line,
            CHANNEL_WIDTH
        );
        ChannelMask(1 << line)
    }

    pub fn bits(&self) -> u32 {
        self.0
    }

    pub fn contains(&self, other: ChannelMask) -> bool {
        self.0 & other.0 == other.0
    }

    /// The word written to the device: this mask with [`IDLE_FLAGS`] forced high.
    pub fn output_word(&self) -> u32 {
        self.0 | IDLE_FLAGS
    }

    /// Parses a most-significant-bit-first binary string of exactly [`CHANNEL_WIDTH`] characters.
    ///
    /// ```
    /// # use pbcompiler_backend::channel::*;
    /// let mw1 = ChannelMask::from_bit_str("111000000000000000001000").unwrap();
    /// assert_eq!(mw1.bits() & !IDLE_FLAGS, 0b1000);
    /// assert!(ChannelMask::from_bit_str("1000").is_err());
    /// assert!(ChannelMask::from_bit_str("11100000000000000000100x").is_err());
    /// ```
    pub fn from_bit_str(s: &str) -> CompileResult<Self> {
        let malformed = |reason: String| CompileError::MalformedBitString {
            input: s.to_string(),
            reason,
        };
        if s.chars().count() != CHANNEL_WIDTH {
            return Err(malformed(format!(
                "expected {} characters, got {}",
                CHANNEL_WIDTH,
                s.chars().count()
            )));
        }
        let binary = BINARY.as_ref().map_err(|e| malformed(e.to_string()))?;
        if !binary.is_match(s) {
            return Err(malformed("only '0' and '1' are allowed".to_string()));
        }
        u32::from_str_radix(s, 2)
            .map(ChannelMask::from_bits)
            .map_err(|e| malformed(e.to_string()))
    }

    /// Renders the zero-padded, most-significant-bit-first form accepted by [`ChannelMask::from_bit_str`].
    pub fn to_bit_str(&self) -> String {
        format!("{:0width$b}", self.0, width = CHANNEL_WIDTH)
    }
}

impl BitOr for ChannelMask {
    type Output = ChannelMask;
    fn bitor(self, rhs: ChannelMask) -> ChannelMask {
        ChannelMask(self.0 | rhs.0)
    }
}

impl BitOrAssign for ChannelMask {
    fn bitor_assign(&mut self, rhs: ChannelMask) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for ChannelMask {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.to_bit_str())
    }
}

/// Named channel definitions, in the order they were declared.
///
/// Replaces module-level channel constants: sequences look their channels up by name, so a
/// rewired setup only needs a different map.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ChannelMap {
    channels: IndexMap<String, ChannelMask>,
}

impl ChannelMap {
    pub fn new() -> Self {
        Self {
            channels: IndexMap::new(),
        }
    }

    /// Wiring of the ODMR setup: green AOM on output 0, detection gate on 1,
    /// microwave switches on 3 (`mw1`) and 2 (`mw2`).
    pub fn odmr_default() -> Self {
        let mut map = Self::new();
        map.insert("green", ChannelMask::line(0));
        map.insert("detect", ChannelMask::line(1));
        map.insert("mw2", ChannelMask::line(2));
        map.insert("mw1", ChannelMask::line(3));
        map
    }

    /// Builds a map from `(name, bit string)` pairs, failing on the first malformed string.
    pub fn from_bit_strings<'a, I>(pairs: I) -> CompileResult<Self>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut map = Self::new();
        for (name, bit_str) in pairs {
            map.insert(name, ChannelMask::from_bit_str(bit_str)?);
        }
        Ok(map)
    }

    /// Adds or replaces a channel. Returns the previous definition, if any.
    pub fn insert(&mut self, name: &str, mask: ChannelMask) -> Option<ChannelMask> {
        self.channels.insert(name.to_string(), mask)
    }

    pub fn get(&self, name: &str) -> CompileResult<ChannelMask> {
        self.channels
            .get(name)
            .copied()
            .ok_or_else(|| CompileError::UnknownChannel(name.to_string()))
    }

    /// OR of all the named channels.
    pub fn combine(&self, names: &[&str]) -> CompileResult<ChannelMask> {
        let mut mask = ChannelMask::NONE;
        for name in names {
            mask |= self.get(name)?;
        }
        Ok(mask)
    }

    /// Channels in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, ChannelMask)> + '_ {
        self.channels.iter().map(|(name, mask)| (name.as_str(), *mask))
    }

    pub fn names(&self) -> Vec<&str> {
        self.channels.keys().map(|k| k.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn bit_string_round_trip() {
        for bits in [0u32, 1, 0b1011, IDLE_FLAGS | 0b1001, WIDTH_MASK, 0x55_5555] {
            let mask = ChannelMask::from_bits(bits);
            let decoded = ChannelMask::from_bit_str(&mask.to_bit_str()).unwrap();
            assert_eq!(decoded, mask);
        }
    }

    #[test]
    fn rejects_wrong_width_and_non_binary() {
        let too_short = ChannelMask::from_bit_str("11100000000000000000101");
        assert!(matches!(
            too_short,
            Err(CompileError::MalformedBitString { .. })
        ));
        let too_long = ChannelMask::from_bit_str("1110000000000000000010110");
        assert!(too_long.is_err());
        let not_binary = ChannelMask::from_bit_str("111000000000000000002011");
        assert!(not_binary.is_err());
        assert!(ChannelMask::from_bit_str("").is_err());
    }

    #[test]
    fn shared_pattern_parses_repeatedly() {
        assert!(BINARY.is_ok());
        let masks: Vec<_> = (0..CHANNEL_WIDTH)
            .map(|line| ChannelMask::line(line).to_bit_str())
            .map(|bits| ChannelMask::from_bit_str(&bits).unwrap())
            .collect();
        assert_eq!(masks[23], ChannelMask::from_bits(1 << 23));
        assert!(ChannelMask::from_bit_str("0000000000000000000000a0").is_err());
    }

    #[test]
    fn idle_flags_always_on_output() {
        assert_eq!(ChannelMask::NONE.output_word(), IDLE_FLAGS);
        let green = ChannelMask::line(0);
        assert_eq!(green.output_word(), 0b111000000000000000000001);
        // A definition that already carries the flags is unaffected
        let with_flags = ChannelMask::from_bit_str("111000000000000000000001").unwrap();
        assert_eq!(with_flags.output_word(), green.output_word());
    }

    #[test]
    fn default_map_matches_wiring() {
        let map = ChannelMap::odmr_default();
        assert_eq!(map.names(), vec!["green", "detect", "mw2", "mw1"]);
        assert_eq!(
            map.combine(&["green", "detect", "mw1"]).unwrap().output_word(),
            0b111000000000000000001011
        );
        assert_eq!(
            map.get("laser"),
            Err(CompileError::UnknownChannel("laser".to_string()))
        );
    }

    #[test]
    fn map_from_bit_strings() {
        let map = ChannelMap::from_bit_strings([
            ("green", "111000000000000000000001"),
            ("mw1", "111000000000000000001000"),
        ])
        .unwrap();
        assert_eq!(map.len(), 2);
        assert!(ChannelMap::from_bit_strings([("green", "01")]).is_err());
    }
}
