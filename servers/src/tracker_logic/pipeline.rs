//! Wires the exchanger pool, the worker pool and the connection manager into
//! the tracker pipeline.
//!
//! ```text
//! feeds --tasks--> ingest loop --RouteJob--> worker pool --RouteReport--> report loop
//!                      ^                                                      |
//!                      | inbound frames                              outbound frames
//!                      |                                                      v
//!                  subscribers <--------------- connection manager <----------+
//! ```
//!
//! The ingest loop collects fixes into one open route per entity. Every
//! `aggregate_every` fixes, and when the entity's subscriber sends `finish`,
//! a snapshot of the route goes to the worker pool. Aggregates go to the
//! subscriber whose identity equals the entity id.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use lib_common::connections::SubscriberIdResolver;
use lib_common::core::{
    ConnectionManager, ConnectionManagerConfig, ExchangerPool, ExchangerPoolConfig, InboundFrame,
    OutboundFrame, WorkerPool,
};
use lib_common::geo::{gps_parser, walker, GpsData, Location, Route};
use lib_common::ingestors::{ExchangeResult, Task};
use lib_common::workers::{RouteJob, RouteReport, RouteWorker};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::tracker_logic::config::Config;
use crate::tracker_logic::model::{ClientMessage, ServerMessage};

/// Where synthetic walkers start.
const WALKER_ORIGIN: Location = Location {
    latitude: 52.3676,
    longitude: 4.9041,
    altitude: 0.0,
};

pub struct Pipeline {
    pub exchangers: ExchangerPool<GpsData>,
    pub workers: WorkerPool<RouteWorker>,
    pub connections: Arc<ConnectionManager>,
    pub resolver: SubscriberIdResolver,
    aggregate_every: usize,
    write_capacity: usize,
    ingest: Mutex<Option<JoinHandle<()>>>,
    report: Mutex<Option<JoinHandle<()>>>,
}

impl Pipeline {
    /// Builds every component and registers the configured feeds. Feeds start
    /// streaming right away; call [`Pipeline::start`] to begin consuming.
    pub fn new(config: &Config) -> Result<Arc<Self>> {
        let exchangers = ExchangerPool::new(ExchangerPoolConfig {
            max_count: config.max_exchangers.unwrap_or(16),
            task_capacity: config.task_capacity.unwrap_or(1024),
            test_tick: Duration::from_millis(config.test_interval_ms.unwrap_or(100)),
        });
        let workers = WorkerPool::new("route-aggregation", RouteWorker::roster(config.workers.unwrap_or(4).max(1)));
        workers.create();

        let connections = Arc::new(ConnectionManager::new(ConnectionManagerConfig {
            outbound_capacity: config.outbound_capacity.unwrap_or(256),
            inbound_capacity: config.inbound_capacity.unwrap_or(64),
            ..Default::default()
        }));

        for feed in config.parsed_live_feeds()? {
            exchangers
                .add(&feed.name, &feed.host, &feed.port, gps_parser())
                .with_context(|| format!("registering live feed {}", feed.name))?;
            log::info!("Live feed '{}' registered at {}:{}", feed.name, feed.host, feed.port);
        }
        for _ in 0..config.test_feeds.unwrap_or(0) {
            let entity = Uuid::new_v4();
            let name = format!("walker-{}", entity);
            exchangers
                .add_test(&name, walker(entity, WALKER_ORIGIN))
                .with_context(|| format!("registering test feed {}", name))?;
            log::info!("Test feed '{}' registered", name);
        }

        Ok(Arc::new(Self {
            exchangers,
            workers,
            connections,
            resolver: SubscriberIdResolver::with_api_key(config.api_key.clone().unwrap_or_default()),
            aggregate_every: config.aggregate_every(),
            write_capacity: config.write_capacity.unwrap_or(1024).max(1),
            ingest: Mutex::new(None),
            report: Mutex::new(None),
        }))
    }

    /// Takes the queues and spawns the ingest and report loops.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let tasks = self.exchangers.out().context("task queue already taken")?;
        let results = self.exchangers.results().context("result queue already taken")?;
        let inbound = self.connections.read_channel().context("read channel already taken")?;

        let (write_tx, write_rx) = mpsc::channel(self.write_capacity);
        self.connections.with_write_channel(write_rx);
        self.connections.start_write()?;

        let (report_tx, report_rx) = mpsc::channel(self.write_capacity);

        let ingest = tokio::spawn(Arc::clone(self).ingest(tasks, results, inbound, report_tx, write_tx.clone()));
        let report = tokio::spawn(report_loop(report_rx, write_tx));
        *self.ingest.lock().expect("Pipeline handle lock poisoned") = Some(ingest);
        *self.report.lock().expect("Pipeline handle lock poisoned") = Some(report);
        log::info!("Pipeline started with {} workers", self.workers.size());
        Ok(())
    }

    /// Ordered teardown: feeds, then workers, then subscriber connections.
    pub async fn shutdown(&self) {
        log::info!("Stopping exchanger pool...");
        self.exchangers.stop_pool().await;
        join(&self.ingest, "ingest").await;

        log::info!("Releasing worker pool...");
        self.workers.print_stats();
        if let Err(e) = self.workers.wait().await {
            log::error!("Worker pool release failed: {}", e);
        }
        join(&self.report, "report").await;

        log::info!("Closing subscriber connections...");
        self.connections.shutdown().await;
        log::info!("Pipeline stopped. Delivery: {:?}", self.connections.delivery_stats());
    }

    async fn ingest(
        self: Arc<Self>,
        mut tasks: mpsc::Receiver<Task<GpsData>>,
        mut results: mpsc::UnboundedReceiver<ExchangeResult>,
        mut inbound: mpsc::Receiver<InboundFrame>,
        reports: mpsc::Sender<RouteReport>,
        write: mpsc::Sender<OutboundFrame>,
    ) {
        let mut routes: HashMap<Uuid, Route> = HashMap::new();
        loop {
            tokio::select! {
                task = tasks.recv() => match task {
                    Some(task) => self.on_fix(&mut routes, task.data, &reports).await,
                    None => break,
                },
                Some(frame) = inbound.recv() => self.on_frame(&mut routes, frame, &reports, &write).await,
                Some(result) = results.recv() => log_result(&result),
            }
        }
        while let Ok(result) = results.try_recv() {
            log_result(&result);
        }
        log::info!("Ingest loop exited with {} open routes", routes.len());
    }

    async fn on_fix(&self, routes: &mut HashMap<Uuid, Route>, fix: GpsData, reports: &mpsc::Sender<RouteReport>) {
        let subscriber = fix.entity_id;
        let route = routes.entry(subscriber).or_insert_with(|| {
            let mut route = Route::new(Uuid::new_v4());
            route.start_time = Some(fix.timestamp);
            route
        });
        route.push(fix);
        if route.len() % self.aggregate_every == 0 {
            let route = route.clone();
            self.dispatch(subscriber, route, reports).await;
        }
    }

    async fn on_frame(
        &self,
        routes: &mut HashMap<Uuid, Route>,
        frame: InboundFrame,
        reports: &mpsc::Sender<RouteReport>,
        write: &mpsc::Sender<OutboundFrame>,
    ) {
        let subscriber = frame.producer_id;
        let reply = match serde_json::from_slice::<ClientMessage>(&frame.payload) {
            Ok(ClientMessage::Ping) => ServerMessage::new("pong", None),
            Ok(ClientMessage::Finish) => match routes.remove(&subscriber) {
                Some(mut route) => {
                    route.finished = true;
                    route.end_time = route.path.last().map(|p| p.timestamp);
                    self.dispatch(subscriber, route, reports).await;
                    return;
                }
                None => ServerMessage::error("no open route"),
            },
            Err(e) => {
                log::debug!("Unreadable message from '{}': {}", subscriber, e);
                ServerMessage::error(format!("unreadable message: {}", e))
            }
        };
        let frame = OutboundFrame {
            payload: reply.to_bytes(),
            consumer_id: subscriber,
        };
        if write.send(frame).await.is_err() {
            log::warn!("Write channel closed, reply to '{}' dropped", subscriber);
        }
    }

    async fn dispatch(&self, subscriber: Uuid, route: Route, reports: &mpsc::Sender<RouteReport>) {
        if let Err(e) = self.workers.work(RouteJob { subscriber, route }, reports.clone()).await {
            log::warn!("Route for '{}' not aggregated: {}", subscriber, e);
        }
    }
}

async fn report_loop(mut reports: mpsc::Receiver<RouteReport>, write: mpsc::Sender<OutboundFrame>) {
    while let Some(report) = reports.recv().await {
        let kind = if report.finished { "route_finished" } else { "aggregate" };
        let message = match serde_json::to_value(&report.aggregate) {
            Ok(value) => ServerMessage::new(kind, Some(value)),
            Err(e) => ServerMessage::error(e.to_string()),
        };
        let frame = OutboundFrame {
            payload: message.to_bytes(),
            consumer_id: report.subscriber,
        };
        if write.send(frame).await.is_err() {
            log::warn!("Write channel closed, report loop exiting");
            break;
        }
    }
    log::info!("Report loop exited");
}

fn log_result(result: &ExchangeResult) {
    match &result.error {
        None => log::info!("Exchanger '{}' finished after {} tasks", result.name, result.received_tasks),
        Some(e) => log::warn!(
            "Exchanger '{}' ({}:{}) ended after {} tasks: {}",
            result.name,
            result.host,
            result.port,
            result.received_tasks,
            e
        ),
    }
}

async fn join(slot: &Mutex<Option<JoinHandle<()>>>, name: &str) {
    let handle = slot.lock().expect("Pipeline handle lock poisoned").take();
    if let Some(handle) = handle {
        if let Err(e) = handle.await {
            log::error!("{} loop panicked: {}", name, e);
        }
    }
}
