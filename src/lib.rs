pub mod hello;
pub mod ids;
pub mod rsocket_lite;
pub mod state_machine;

/// Host the demo client connects to unless told otherwise.
pub const DEFAULT_HOST: &str = "localhost";

pub const DEFAULT_PORT: u16 = 7878;

/// Metadata pushed by the demo client right after connecting.
pub const DEMO_METADATA: &str = "RUST";

/// Ids per batch in the demo channel interaction.
pub const CHANNEL_BATCH_SIZE: usize = 3;
