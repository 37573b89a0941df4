//! Worker that turns a collected [`Route`] into its [`AggregatedData`].

use uuid::Uuid;

use crate::core::worker_pool::Worker;
use crate::geo::aggregator::aggregate_route;
use crate::geo::models::{AggregatedData, Route};

/// A route to aggregate and the subscriber that gets the result.
#[derive(Debug, Clone)]
pub struct RouteJob {
    /// Receiving subscriber. The tracked entity's id.
    pub subscriber: Uuid,
    /// Snapshot of the route so far.
    pub route: Route,
}

/// The aggregate of a [`RouteJob`].
#[derive(Debug, Clone, PartialEq)]
pub struct RouteReport {
    /// Receiving subscriber.
    pub subscriber: Uuid,
    /// Whether the route was closed when aggregated.
    pub finished: bool,
    /// The figures.
    pub aggregate: AggregatedData,
}

/// Stateless aggregation worker with a processed-task counter.
#[derive(Debug)]
pub struct RouteWorker {
    id: usize,
    processed: usize,
    last_route: Option<Uuid>,
}

impl RouteWorker {
    /// A fresh worker.
    pub fn new(id: usize) -> Self {
        Self {
            id,
            processed: 0,
            last_route: None,
        }
    }

    /// Workers numbered `1..=count`.
    pub fn roster(count: usize) -> Vec<Self> {
        (1..=count).map(Self::new).collect()
    }

    /// Tasks completed so far.
    pub fn processed(&self) -> usize {
        self.processed
    }
}

impl Worker for RouteWorker {
    type Task = RouteJob;
    type Output = RouteReport;

    fn id(&self) -> usize {
        self.id
    }

    fn stat(&self) -> String {
        match self.last_route {
            Some(route) => format!(
                "[worker {}] processed: {}, last route: {}",
                self.id, self.processed, route
            ),
            None => format!("[worker {}] processed: {}, idle", self.id, self.processed),
        }
    }

    fn increment_tasks(&mut self) {
        self.processed += 1;
    }

    fn work(&mut self, job: RouteJob) -> RouteReport {
        self.last_route = Some(job.route.route_id);
        RouteReport {
            subscriber: job.subscriber,
            finished: job.route.finished,
            aggregate: aggregate_route(&job.route),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::worker_pool::WorkerPool;
    use tokio::sync::mpsc;

    fn job(route_id: Uuid) -> RouteJob {
        RouteJob {
            subscriber: Uuid::nil(),
            route: Route::new(route_id),
        }
    }

    #[tokio::test]
    async fn pool_of_route_workers_aggregates() {
        let pool = WorkerPool::new("routes", RouteWorker::roster(2));
        pool.create();

        let (tx, mut rx) = mpsc::channel(4);
        let ids = [Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4()];
        for id in ids {
            pool.work(job(id), tx.clone()).await.unwrap();
        }
        drop(tx);

        let mut seen = Vec::new();
        while let Some(report) = rx.recv().await {
            assert_eq!(report.subscriber, Uuid::nil());
            assert!(!report.finished);
            assert_eq!(report.aggregate.amount_points, 0);
            seen.push(report.aggregate.route_id);
        }
        seen.sort();
        let mut expected = ids.to_vec();
        expected.sort();
        assert_eq!(seen, expected);

        pool.wait().await.unwrap();
        assert!(pool.stats().iter().all(|s| s.starts_with("[worker")));
    }

    #[test]
    fn stat_reports_progress() {
        let mut worker = RouteWorker::new(7);
        assert!(worker.stat().contains("idle"));
        let mut closed = job(Uuid::nil());
        closed.route.finished = true;
        assert!(worker.work(closed).finished);
        worker.increment_tasks();
        assert_eq!(worker.processed(), 1);
        assert!(worker.stat().contains(&Uuid::nil().to_string()));
    }
}
