use serde::{Deserialize, Serialize};

/// Terminal input mode, forwarded as-is to the device driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TermMode {
    /// Cooked mode; restores the settings saved before the first raw switch.
    Normal,
    /// Raw input, but signal keys (Ctrl-C and friends) still work.
    Raw,
    /// Fully raw input and output.
    RawIo,
}
