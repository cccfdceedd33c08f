/// Event pump: the single task that talks to the session adapter
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use super::types::{classify_error, ErrorDisposition, PumpCommand, SessionEvent};
use crate::broker::{EventSink, HistoricalDataRequest, SessionAdapter};
use crate::connection::ConnectionManager;
use crate::error::{Result, TwsError};
use crate::requests::RequestCorrelator;
use crate::types::RequestId;

/// Drains session events and caller commands on one task
pub struct EventPump {
    adapter: Box<dyn SessionAdapter>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    events_rx: mpsc::UnboundedReceiver<SessionEvent>,
    commands_rx: mpsc::UnboundedReceiver<PumpCommand>,
}

/// Caller-side handle; every adapter call goes through here
#[derive(Clone)]
pub struct PumpHandle {
    commands: mpsc::UnboundedSender<PumpCommand>,
}

impl EventPump {
    pub fn new(adapter: Box<dyn SessionAdapter>) -> (Self, PumpHandle) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();

        let pump = EventPump {
            adapter,
            events_tx,
            events_rx,
            commands_rx,
        };
        (pump, PumpHandle { commands: commands_tx })
    }

    /// Run until shutdown; spawn this on the client's runtime
    pub async fn run(mut self, connection: Arc<ConnectionManager>, correlator: Arc<RequestCorrelator>) {
        info!("🚀 Event pump started");

        loop {
            // Events first: anything the session emitted before replying to a
            // command is dispatched before the next command runs
            tokio::select! {
                biased;
                Some(event) = self.events_rx.recv() => {
                    dispatch(event, &connection, &correlator).await;
                }
                command = self.commands_rx.recv() => match command {
                    Some(PumpCommand::Shutdown) | None => break,
                    Some(command) => self.execute(command),
                },
            }
        }

        correlator.fail_all("event pump stopped").await;
        info!("🛑 Event pump stopped");
    }

    fn execute(&mut self, command: PumpCommand) {
        debug!("Executing pump command: {}", command.as_str());

        match command {
            PumpCommand::Connect {
                host,
                port,
                client_id,
                reply,
            } => {
                let sink = EventSink::new(self.events_tx.clone());
                let result = self.adapter.connect(&host, port, client_id, sink);
                send_reply(reply, result);
            }
            PumpCommand::Disconnect { reply } => {
                let result = self.adapter.disconnect();
                send_reply(reply, result);
            }
            PumpCommand::SendHistorical {
                request_id,
                request,
                reply,
            } => {
                let result = self.adapter.send_historical_data_request(request_id, &request);
                send_reply(reply, result);
            }
            PumpCommand::Cancel { request_id } => {
                if let Err(e) = self.adapter.cancel_historical_data(request_id) {
                    debug!("Cancel for request {} failed: {}", request_id, e);
                }
            }
            PumpCommand::Shutdown => {}
        }
    }
}

fn send_reply(reply: oneshot::Sender<Result<()>>, result: Result<()>) {
    if reply.send(result).is_err() {
        debug!("Pump command caller went away before the reply");
    }
}

async fn dispatch(event: SessionEvent, connection: &ConnectionManager, correlator: &RequestCorrelator) {
    debug!("Dispatching session event: {}", event.as_str());

    match event {
        SessionEvent::ConnectAck { server_version } => connection.on_connect_ack(server_version),
        SessionEvent::NextValidId(id) => {
            correlator.raise_floor(id);
            connection.on_next_valid_id(id);
        }
        SessionEvent::HistoricalBar { request_id, bar } => correlator.on_data(request_id, bar).await,
        SessionEvent::HistoricalDataEnd {
            request_id,
            start,
            end,
        } => {
            debug!("Historical data end for {}: {} - {}", request_id, start, end);
            correlator.on_complete(request_id).await;
        }
        SessionEvent::Error {
            request_id,
            code,
            message,
        } => match classify_error(request_id, code) {
            ErrorDisposition::Info => info!("ℹ️  TWS notice {}: {}", code, message),
            ErrorDisposition::Warning => warn!("⚠️  TWS warning {} (request {}): {}", code, request_id, message),
            ErrorDisposition::SessionError => error!("❌ TWS error {}: {}", code, message),
            ErrorDisposition::Fatal => connection.on_fatal(code, &message).await,
            ErrorDisposition::Request => correlator.on_error(request_id, code, &message).await,
        },
        SessionEvent::ConnectionClosed => connection.on_connection_closed().await,
    }
}

impl PumpHandle {
    async fn call(&self, make: impl FnOnce(oneshot::Sender<Result<()>>) -> PumpCommand) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(make(reply))
            .map_err(|_| TwsError::SessionClosed("event pump stopped".to_string()))?;
        rx.await
            .map_err(|_| TwsError::SessionClosed("event pump dropped the command".to_string()))?
    }

    pub async fn connect(&self, host: &str, port: u16, client_id: i32) -> Result<()> {
        let host = host.to_string();
        self.call(|reply| PumpCommand::Connect {
            host,
            port,
            client_id,
            reply,
        })
        .await
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.call(|reply| PumpCommand::Disconnect { reply }).await
    }

    pub async fn send_historical(&self, request_id: RequestId, request: HistoricalDataRequest) -> Result<()> {
        self.call(|reply| PumpCommand::SendHistorical {
            request_id,
            request: Box::new(request),
            reply,
        })
        .await
    }

    /// Fire and forget
    pub fn cancel(&self, request_id: RequestId) {
        if self.commands.send(PumpCommand::Cancel { request_id }).is_err() {
            debug!("Pump stopped, cancel for {} not sent", request_id);
        }
    }

    pub fn shutdown(&self) {
        let _ = self.commands.send(PumpCommand::Shutdown);
    }

    pub fn is_running(&self) -> bool {
        !self.commands.is_closed()
    }

    /// Resolves once the pump has exited
    pub async fn stopped(&self) {
        self.commands.closed().await
    }
}
