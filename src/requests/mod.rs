pub mod correlator;

pub use correlator::{RequestCorrelator, Waiter, INITIAL_REQUEST_ID};
