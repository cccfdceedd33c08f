pub mod pump;
pub mod types;

pub use pump::{EventPump, PumpHandle};
pub use types::{classify_error, ErrorDisposition, PumpCommand, RawBar, SessionEvent};
