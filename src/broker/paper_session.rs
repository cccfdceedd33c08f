/// Simulated TWS session for tests and offline runs
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::adapter::{EventSink, HistoricalDataRequest, SessionAdapter};
use crate::error::{Result, TwsError};
use crate::events::{RawBar, SessionEvent};
use crate::types::{RequestId, TimeRange};
use crate::utils::{format_end_datetime, market_timezone};

pub const SERVER_VERSION: i32 = 176;

/// Upper bound on bars generated for a single request
const MAX_BARS_PER_REQUEST: i64 = 100_000;

/// How the simulated gateway answers a connect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectBehavior {
    Ack,
    /// Ack arrives, next valid id does not until `emit_next_valid_id`
    AckWithoutNextId,
    DelayedAck(Duration),
    NoAck,
    Refuse,
}

/// How the simulated gateway answers one historical request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HistoricalBehavior {
    Respond,
    RespondAfter(Duration),
    Error { code: i32, message: String },
    /// Never answers until `release_held`
    Hold,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateStyle {
    Epoch,
    /// `yyyyMMdd HH:mm:ss <zone>` in the exchange timezone
    ExchangeLocal,
}

struct PaperState {
    sink: Option<EventSink>,
    connect_behavior: ConnectBehavior,
    default_behavior: HistoricalBehavior,
    scripted: VecDeque<HistoricalBehavior>,
    date_style: DateStyle,
    next_valid_id: i64,
    connect_calls: usize,
    requests: Vec<(RequestId, HistoricalDataRequest)>,
    cancelled: Vec<RequestId>,
    held: Vec<(RequestId, HistoricalDataRequest)>,
}

/// Session adapter that fabricates deterministic bars on the bar-size grid.
///
/// Clones share state, so a test can keep one handle while the client owns
/// the other.
#[derive(Clone)]
pub struct PaperSession {
    state: Arc<Mutex<PaperState>>,
}

impl Default for PaperSession {
    fn default() -> Self {
        Self::new()
    }
}

impl PaperSession {
    pub fn new() -> Self {
        PaperSession {
            state: Arc::new(Mutex::new(PaperState {
                sink: None,
                connect_behavior: ConnectBehavior::Ack,
                default_behavior: HistoricalBehavior::Respond,
                scripted: VecDeque::new(),
                date_style: DateStyle::Epoch,
                next_valid_id: 1,
                connect_calls: 0,
                requests: Vec::new(),
                cancelled: Vec::new(),
                held: Vec::new(),
            })),
        }
    }

    pub fn with_connect_behavior(self, behavior: ConnectBehavior) -> Self {
        self.lock().connect_behavior = behavior;
        self
    }

    pub fn with_default_behavior(self, behavior: HistoricalBehavior) -> Self {
        self.lock().default_behavior = behavior;
        self
    }

    pub fn with_date_style(self, style: DateStyle) -> Self {
        self.lock().date_style = style;
        self
    }

    pub fn with_next_valid_id(self, id: i64) -> Self {
        self.lock().next_valid_id = id;
        self
    }

    /// Behaviors consumed in order by the next requests
    pub fn script(&self, behaviors: Vec<HistoricalBehavior>) {
        self.lock().scripted.extend(behaviors);
    }

    pub fn connect_calls(&self) -> usize {
        self.lock().connect_calls
    }

    pub fn is_connected(&self) -> bool {
        self.lock().sink.is_some()
    }

    pub fn request_count(&self) -> usize {
        self.lock().requests.len()
    }

    pub fn requests(&self) -> Vec<(RequestId, HistoricalDataRequest)> {
        self.lock().requests.clone()
    }

    /// Ranges the session was asked for, in arrival order
    pub fn requested_ranges(&self) -> Vec<TimeRange> {
        self.lock()
            .requests
            .iter()
            .filter_map(|(_, request)| request.requested_range().ok())
            .collect()
    }

    pub fn cancelled(&self) -> Vec<RequestId> {
        self.lock().cancelled.clone()
    }

    /// Answer every held request now
    pub fn release_held(&self) -> usize {
        let (sink, held, style) = {
            let mut state = self.lock();
            (state.sink.clone(), std::mem::take(&mut state.held), state.date_style)
        };
        let count = held.len();
        if let Some(sink) = sink {
            for (request_id, request) in held {
                respond(&sink, request_id, &request, style);
            }
        }
        count
    }

    pub fn emit_next_valid_id(&self) {
        let state = self.lock();
        if let Some(sink) = &state.sink {
            sink.emit(SessionEvent::NextValidId(state.next_valid_id));
        }
    }

    /// Push the 1100 notice TWS sends when it loses the IB servers
    pub fn simulate_connectivity_loss(&self) {
        self.emit(SessionEvent::Error {
            request_id: -1,
            code: 1100,
            message: "Connectivity between IB and Trader Workstation has been lost.".to_string(),
        });
    }

    pub fn simulate_peer_close(&self) {
        let sink = self.lock().sink.take();
        if let Some(sink) = sink {
            sink.emit(SessionEvent::ConnectionClosed);
        }
    }

    fn emit(&self, event: SessionEvent) {
        if let Some(sink) = &self.lock().sink {
            sink.emit(event);
        }
    }

    fn lock(&self) -> MutexGuard<'_, PaperState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl SessionAdapter for PaperSession {
    fn connect(&mut self, host: &str, port: u16, client_id: i32, sink: EventSink) -> Result<()> {
        let mut state = self.lock();
        state.connect_calls += 1;

        if state.connect_behavior == ConnectBehavior::Refuse {
            warn!("📝 [PAPER] Refusing connection to {}:{}", host, port);
            return Err(TwsError::NotConnected(format!(
                "connection refused by {}:{}",
                host, port
            )));
        }

        state.sink = Some(sink.clone());
        let next_valid_id = state.next_valid_id;
        info!("📝 [PAPER] Session opened for client {} at {}:{}", client_id, host, port);

        match state.connect_behavior {
            ConnectBehavior::Ack => {
                sink.emit(SessionEvent::ConnectAck { server_version: SERVER_VERSION });
                sink.emit(SessionEvent::NextValidId(next_valid_id));
            }
            ConnectBehavior::AckWithoutNextId => {
                sink.emit(SessionEvent::ConnectAck { server_version: SERVER_VERSION });
            }
            ConnectBehavior::DelayedAck(delay) => {
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    sink.emit(SessionEvent::ConnectAck { server_version: SERVER_VERSION });
                    sink.emit(SessionEvent::NextValidId(next_valid_id));
                });
            }
            ConnectBehavior::NoAck | ConnectBehavior::Refuse => {}
        }

        Ok(())
    }

    fn disconnect(&mut self) -> Result<()> {
        let mut state = self.lock();
        state.held.clear();
        if let Some(sink) = state.sink.take() {
            sink.emit(SessionEvent::ConnectionClosed);
            info!("📝 [PAPER] Session closed");
        }
        Ok(())
    }

    fn send_historical_data_request(
        &mut self,
        request_id: RequestId,
        request: &HistoricalDataRequest,
    ) -> Result<()> {
        let mut state = self.lock();
        let sink = state
            .sink
            .clone()
            .ok_or_else(|| TwsError::NotConnected("paper session not connected".to_string()))?;

        state.requests.push((request_id, request.clone()));
        let behavior = state
            .scripted
            .pop_front()
            .unwrap_or_else(|| state.default_behavior.clone());
        let style = state.date_style;

        debug!(
            "📝 [PAPER] Request {}: {} {} ending {} ({:?})",
            request_id, request.contract.symbol, request.duration, request.end_date_time, behavior
        );

        match behavior {
            HistoricalBehavior::Respond => respond(&sink, request_id, request, style),
            HistoricalBehavior::RespondAfter(delay) => {
                let request = request.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    respond(&sink, request_id, &request, style);
                });
            }
            HistoricalBehavior::Error { code, message } => {
                sink.emit(SessionEvent::Error {
                    request_id,
                    code,
                    message,
                });
            }
            HistoricalBehavior::Hold => state.held.push((request_id, request.clone())),
        }

        Ok(())
    }

    fn cancel_historical_data(&mut self, request_id: RequestId) -> Result<()> {
        let mut state = self.lock();
        state.cancelled.push(request_id);
        debug!("📝 [PAPER] Cancel for request {}", request_id);
        Ok(())
    }
}

fn respond(sink: &EventSink, request_id: RequestId, request: &HistoricalDataRequest, style: DateStyle) {
    let range = match request.requested_range() {
        Ok(range) => range,
        Err(e) => {
            sink.emit(SessionEvent::Error {
                request_id,
                code: 321,
                message: format!("Error validating request: {}", e),
            });
            return;
        }
    };

    for bar in synthetic_bars(request, &range, style) {
        sink.emit(SessionEvent::HistoricalBar { request_id, bar });
    }
    sink.emit(SessionEvent::HistoricalDataEnd {
        request_id,
        start: format_end_datetime(range.start),
        end: format_end_datetime(range.end),
    });
}

/// Bars at every grid point in `[start, end)`; prices depend only on symbol and time
fn synthetic_bars(request: &HistoricalDataRequest, range: &TimeRange, style: DateStyle) -> Vec<RawBar> {
    let step = request.bar_size.duration().num_seconds().max(1);
    let first = (range.start.timestamp() + step - 1).div_euclid(step) * step;
    let seed = request
        .contract
        .symbol
        .bytes()
        .fold(0u64, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u64));
    let base = 50.0 + (seed % 200) as f64;
    let tz = market_timezone(&request.contract.exchange);

    (0..MAX_BARS_PER_REQUEST)
        .map(|i| first + i * step)
        .take_while(|ts| *ts < range.end.timestamp())
        .filter_map(|ts| {
            let timestamp = DateTime::<Utc>::from_timestamp(ts, 0)?;
            let wave = ((ts / step) % 40) as f64 * 0.05;
            let open = base + wave;
            let close = open + 0.02;
            let date = match style {
                DateStyle::Epoch => ts.to_string(),
                DateStyle::ExchangeLocal => format!(
                    "{} {}",
                    timestamp.with_timezone(&tz).format("%Y%m%d %H:%M:%S"),
                    tz.name()
                ),
            };
            Some(RawBar {
                date,
                open,
                high: close + 0.1,
                low: open - 0.1,
                close,
                volume: 1000.0 + ((ts / step) % 7) as f64 * 100.0,
                wap: (open + close) / 2.0,
                count: 10 + (ts / step) % 5,
            })
        })
        .collect()
}
