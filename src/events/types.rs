/// Session events and pump commands
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::broker::HistoricalDataRequest;
use crate::error::Result;
use crate::types::RequestId;

/// Bar exactly as delivered by the session, before timestamp normalisation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawBar {
    pub date: String,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub wap: f64,
    pub count: i64,
}

/// Callback pushed by the session adapter into the event sink
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    ConnectAck { server_version: i32 },
    NextValidId(i64),
    HistoricalBar { request_id: RequestId, bar: RawBar },
    HistoricalDataEnd { request_id: RequestId, start: String, end: String },
    Error { request_id: RequestId, code: i32, message: String },
    ConnectionClosed,
}

impl SessionEvent {
    pub fn as_str(&self) -> &str {
        match self {
            SessionEvent::ConnectAck { .. } => "CONNECT_ACK",
            SessionEvent::NextValidId(_) => "NEXT_VALID_ID",
            SessionEvent::HistoricalBar { .. } => "HISTORICAL_BAR",
            SessionEvent::HistoricalDataEnd { .. } => "HISTORICAL_DATA_END",
            SessionEvent::Error { .. } => "ERROR",
            SessionEvent::ConnectionClosed => "CONNECTION_CLOSED",
        }
    }
}

/// How an error callback is handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorDisposition {
    /// Farm status chatter
    Info,
    Warning,
    /// Session-level error with no request attached
    SessionError,
    /// Connectivity lost, the session cannot continue
    Fatal,
    /// Fails the request it names
    Request,
}

pub const NO_REQUEST_ID: RequestId = -1;

const FARM_STATUS_CODES: [i32; 3] = [2104, 2106, 2158];
const FATAL_CODES: [i32; 2] = [1100, 1300];

pub fn classify_error(request_id: RequestId, code: i32) -> ErrorDisposition {
    if FATAL_CODES.contains(&code) {
        return ErrorDisposition::Fatal;
    }
    // 2100-2199 are warnings even when attached to a request
    if (2100..2200).contains(&code) {
        return if request_id < 0 && FARM_STATUS_CODES.contains(&code) {
            ErrorDisposition::Info
        } else {
            ErrorDisposition::Warning
        };
    }
    if request_id >= 0 {
        return ErrorDisposition::Request;
    }
    if code < 2000 {
        ErrorDisposition::Warning
    } else {
        ErrorDisposition::SessionError
    }
}

/// Work executed on the pump on behalf of callers
#[derive(Debug)]
pub enum PumpCommand {
    Connect {
        host: String,
        port: u16,
        client_id: i32,
        reply: oneshot::Sender<Result<()>>,
    },
    Disconnect {
        reply: oneshot::Sender<Result<()>>,
    },
    SendHistorical {
        request_id: RequestId,
        request: Box<HistoricalDataRequest>,
        reply: oneshot::Sender<Result<()>>,
    },
    Cancel {
        request_id: RequestId,
    },
    Shutdown,
}

impl PumpCommand {
    pub fn as_str(&self) -> &str {
        match self {
            PumpCommand::Connect { .. } => "CONNECT",
            PumpCommand::Disconnect { .. } => "DISCONNECT",
            PumpCommand::SendHistorical { .. } => "SEND_HISTORICAL",
            PumpCommand::Cancel { .. } => "CANCEL",
            PumpCommand::Shutdown => "SHUTDOWN",
        }
    }
}
