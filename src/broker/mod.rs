pub mod adapter;
pub mod paper_session;

pub use adapter::{EventSink, HistoricalDataRequest, SessionAdapter};
pub use paper_session::{ConnectBehavior, DateStyle, HistoricalBehavior, PaperSession};
