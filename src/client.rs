/// Blocking client facade over the callback-driven session
use chrono::{DateTime, Utc};
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;
use tokio::sync::watch;
use tracing::{debug, info, warn, Instrument, Span};
use uuid::Uuid;

use crate::broker::SessionAdapter;
use crate::config::validate_config;
use crate::connection::ConnectionManager;
use crate::data::{BarSeriesKey, FetchPlan, HistoricalDataCache, HistoricalDataSync};
use crate::error::{Result, TwsError};
use crate::events::{EventPump, PumpHandle};
use crate::requests::RequestCorrelator;
use crate::types::{Bar, BarSize, ClientConfig, ConnectionState, Contract, TimeRange, WhatToShow};
use crate::utils::{parse_duration, RateLimiter};

pub const PUMP_THREAD_NAME: &str = "twsc-event-pump";

/// Synchronous TWS client with a disk-backed bar cache.
///
/// Every public method blocks the calling thread; none may be called from
/// inside an async runtime.
pub struct TwsClient {
    instance_id: Uuid,
    config: ClientConfig,
    connection: Arc<ConnectionManager>,
    correlator: Arc<RequestCorrelator>,
    cache: HistoricalDataCache,
    sync: HistoricalDataSync,
    pump: PumpHandle,
    span: Span,
    runtime: Runtime,
}

impl TwsClient {
    pub fn new<A>(config: ClientConfig, adapter: A) -> Result<Self>
    where
        A: SessionAdapter + 'static,
    {
        validate_config(&config)?;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name(PUMP_THREAD_NAME)
            .enable_all()
            .build()
            .map_err(|e| TwsError::Internal(format!("failed to start runtime: {}", e)))?;

        let instance_id = Uuid::new_v4();
        let span = tracing::info_span!("twsc", instance_id = %instance_id);

        let (pump, handle) = EventPump::new(Box::new(adapter));
        let correlator = Arc::new(RequestCorrelator::new());
        let connection = Arc::new(ConnectionManager::new(handle.clone(), Arc::clone(&correlator)));
        runtime.spawn(
            pump.run(Arc::clone(&connection), Arc::clone(&correlator))
                .instrument(span.clone()),
        );

        let limiter = RateLimiter::new(config.pacing_max_requests, config.pacing_window());
        let sync = HistoricalDataSync::new(
            Arc::clone(&correlator),
            Arc::clone(&connection),
            handle.clone(),
            limiter,
            config.use_rth,
        );
        let cache = HistoricalDataCache::new(config.cache_dir.clone());

        span.in_scope(|| {
            info!(
                "✅ Client created for {}:{} (cache {})",
                config.host,
                config.port,
                config.cache_dir.display()
            )
        });

        Ok(TwsClient {
            instance_id,
            config,
            connection,
            correlator,
            cache,
            sync,
            pump: handle,
            span,
            runtime,
        })
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    fn block_on<F: std::future::Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future.instrument(self.span.clone()))
    }

    pub fn connect(&self) -> Result<()> {
        self.block_on(self.connection.connect(
            &self.config.host,
            self.config.port,
            self.config.client_id,
            self.config.connect_timeout(),
        ))
    }

    pub fn disconnect(&self) -> Result<()> {
        self.block_on(self.connection.disconnect(self.config.disconnect_timeout()))
    }

    /// Leave `Failed` so that `connect` can be called again
    pub fn reset(&self) -> Result<()> {
        self.block_on(self.connection.reset(self.config.disconnect_timeout()))
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.connection.subscribe()
    }

    pub fn pending_requests(&self) -> usize {
        self.block_on(self.correlator.pending_count())
    }

    /// Covered range of the series for the configured `what_to_show`
    pub fn cached_coverage(&self, contract: &Contract, bar_size: BarSize) -> Option<TimeRange> {
        let key = BarSeriesKey::new(contract, bar_size, self.config.what_to_show);
        self.block_on(self.cache.coverage(&key))
    }

    /// Bars for `range`, fetching whatever the cache does not cover
    pub fn get_historical_data(
        &self,
        contract: &Contract,
        bar_size: BarSize,
        range: TimeRange,
        timeout: Duration,
    ) -> Result<Vec<Bar>> {
        self.get_historical_data_for(contract, bar_size, self.config.what_to_show, range, timeout)
    }

    /// Bars for `duration` (e.g. "2 D") ending at `end`
    pub fn get_historical_data_ending(
        &self,
        contract: &Contract,
        bar_size: BarSize,
        end: DateTime<Utc>,
        duration: &str,
        timeout: Duration,
    ) -> Result<Vec<Bar>> {
        let range = TimeRange::ending_at(end, parse_duration(duration)?)?;
        self.get_historical_data(contract, bar_size, range, timeout)
    }

    pub fn get_historical_data_for(
        &self,
        contract: &Contract,
        bar_size: BarSize,
        what_to_show: WhatToShow,
        range: TimeRange,
        timeout: Duration,
    ) -> Result<Vec<Bar>> {
        self.block_on(async {
            self.connection.ensure_ready()?;

            let key = BarSeriesKey::new(contract, bar_size, what_to_show);
            let mut series = self.cache.lock(&key).await;

            let bars = match series.plan(&range, self.config.max_bridge()) {
                FetchPlan::Extend(gaps) if gaps.is_empty() => {
                    debug!("Cache covers {} for {}", range, key);
                    series.read(&range)
                }
                FetchPlan::Extend(gaps) => {
                    self.sync
                        .fetch_missing(&mut series, contract, &gaps, timeout)
                        .await?;
                    series.read(&range)
                }
                FetchPlan::Detached(range) => {
                    self.sync
                        .fetch_detached(contract, &key, range, timeout)
                        .await?
                }
            };
            info!("📊 {} bars for {} in {}", bars.len(), key, range);
            Ok(bars)
        })
    }

    /// Build a client, run `f` while connected, then tear the client down.
    ///
    /// Once this returns or unwinds, the session is disconnected and the event
    /// pump and its runtime thread are gone.
    pub fn with_session<A, T, F>(config: ClientConfig, adapter: A, f: F) -> Result<T>
    where
        A: SessionAdapter + 'static,
        F: FnOnce(&TwsClient) -> Result<T>,
    {
        let client = TwsClient::new(config, adapter)?;
        let result = client.scoped(f);
        drop(client);
        result
    }

    /// Connect, run `f`, and always disconnect. The pump keeps running so the
    /// client can connect again; see [`TwsClient::with_session`].
    ///
    /// An error from `f` wins over a teardown error, which is then only logged.
    pub fn scoped<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&TwsClient) -> Result<T>,
    {
        let guard = self.connect_guard()?;
        let result = f(self);
        let teardown = guard.release();

        match (result, teardown) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), Err(teardown)) => {
                warn!("Disconnect after failed scope also failed: {}", teardown);
                Err(e)
            }
            (Err(e), Ok(())) => Err(e),
        }
    }

    /// Connect and return a guard that disconnects when dropped
    pub fn connect_guard(&self) -> Result<ConnectionGuard<'_>> {
        self.connect()?;
        Ok(ConnectionGuard {
            client: self,
            released: false,
        })
    }
}

impl Drop for TwsClient {
    fn drop(&mut self) {
        if matches!(
            self.state(),
            ConnectionState::Connected | ConnectionState::Connecting
        ) {
            if let Err(e) = self.disconnect() {
                warn!("Disconnect on drop failed: {}", e);
            }
        }
        self.pump.shutdown();

        let pump = self.pump.clone();
        let stopped = self.block_on(async move {
            tokio::time::timeout(Duration::from_secs(1), pump.stopped()).await
        });
        if stopped.is_err() {
            warn!("Event pump did not stop within 1s");
        }
        debug!("Client {} shut down", self.instance_id);
    }
}

/// Connected client that disconnects on drop, including during a panic
pub struct ConnectionGuard<'a> {
    client: &'a TwsClient,
    released: bool,
}

impl ConnectionGuard<'_> {
    /// Disconnect now and report the outcome
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.client.disconnect()
    }
}

impl Deref for ConnectionGuard<'_> {
    type Target = TwsClient;

    fn deref(&self) -> &TwsClient {
        self.client
    }
}

impl Drop for ConnectionGuard<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.client.disconnect() {
            warn!("Disconnect on guard drop failed: {}", e);
        }
    }
}
