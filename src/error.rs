/// Errors raised by the library.
///
/// Decoding never fails: unknown ids and truncated payloads are skipped. What
/// remains are configuration violations, which are fatal at startup, and
/// transport failures, which callers log and retry on the next tick.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("at least one battery must be configured")]
    NoBatteries,
    #[error("at most {max} batteries are supported, got {count}")]
    TooManyBatteries { count: usize, max: usize },
    #[error("battery '{name}': heartbeat id 0x{id:03X} out of range 0x000-0x3FF")]
    HeartbeatIdRange { name: String, id: u16 },
    #[error("battery '{name}': heartbeat text must be 1-8 characters, got {len}")]
    HeartbeatTextLength { name: String, len: usize },
    #[error("battery '{name}': heartbeat text must be alphanumeric, got '{text}'")]
    HeartbeatTextCharset { name: String, text: String },
    #[error("battery '{name}': current cap {value} A out of range 0-100 A")]
    CurrentCap { name: String, value: f32 },
    #[error("battery '{0}' has no CAN interface configured")]
    MissingInterface(String),
    #[error("battery '{name}': interface {interface} is already used by another bus")]
    SharedInterface { name: String, interface: String },
    #[error("duplicate battery name '{0}'")]
    DuplicateBattery(String),
    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),
    #[error("invalid CAN id '{0}'")]
    InvalidId(String),
    #[error("CAN id 0x{0:X} exceeds the 11 bit range")]
    IdRange(u32),
    #[error("payload of {0} bytes exceeds 8 bytes")]
    PayloadLength(usize),
    #[error("candump line {line}: {reason}")]
    Candump { line: usize, reason: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
