//! Command tokens written by the central to the input characteristic.

/// A recognised command.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Command {
    /// `RN`: read the sensor now and notify the record.
    ReadNow,
    /// `RH`: historical read. No history is kept; answered with an empty record.
    ReadHistory,
}

impl Command {
    /// Exact-match parse; anything else is not a command.
    pub fn parse(raw: &[u8]) -> Option<Self> {
        match raw {
            b"RN" => Some(Command::ReadNow),
            b"RH" => Some(Command::ReadHistory),
            _ => None,
        }
    }
}
