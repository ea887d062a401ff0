// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::any::type_name;
use std::future::Future;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, trace, warn};

use crate::service::WorkerPoolSection;
use crate::{AppError, AppResult, Shutdown};

/// Handler trait for processing tasks
pub trait PoolHandler<T>: Clone + Send + Sync + 'static {
    fn handle(&self, task: T) -> impl Future<Output = ()> + Send;
}

/// Worker Pool Config Parameters
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub workers: usize,
    pub channel_capacity: usize,
    pub monitor_interval: Duration,
    /// how long the monitor waits on each worker handle per check
    pub worker_check_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            workers: num_cpus::get(),
            channel_capacity: 1024,
            monitor_interval: Duration::from_secs(5),
            worker_check_timeout: Duration::from_millis(200),
        }
    }
}

impl From<&WorkerPoolSection> for WorkerPoolConfig {
    fn from(section: &WorkerPoolSection) -> Self {
        Self {
            workers: section.workers.max(1),
            channel_capacity: section.channel_capacity.max(1),
            monitor_interval: Duration::from_millis(section.monitor_interval_ms),
            worker_check_timeout: Duration::from_millis(section.worker_check_timeout_ms),
        }
    }
}

/// Submission side of a [`WorkerPool`].
///
/// Cheap to clone; tasks that need to queue follow-up work (auction start and
/// end timers, delayed pongs) hold one of these instead of the pool.
#[derive(Debug)]
pub struct TaskQueue<T> {
    sender: async_channel::Sender<T>,
    notify_shutdown: broadcast::Sender<()>,
}

impl<T> Clone for TaskQueue<T> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            notify_shutdown: self.notify_shutdown.clone(),
        }
    }
}

impl<T: Send + 'static> TaskQueue<T> {
    /// Queues `task` without waiting. A full or closed queue is an error
    /// the caller has to answer, the receive loop never blocks here.
    pub fn submit(&self, task: T) -> AppResult<()> {
        self.sender.try_send(task).map_err(|e| match e {
            async_channel::TrySendError::Full(_) => {
                AppError::ChannelSendError("worker queue is full".to_string())
            }
            async_channel::TrySendError::Closed(_) => {
                AppError::ChannelSendError("worker pool is shut down".to_string())
            }
        })
    }

    /// Queues `task` once `delay` has passed. Pending timers are dropped when
    /// the pool shuts down.
    pub fn schedule(&self, task: T, delay: Duration) {
        let sender = self.sender.clone();
        let mut shutdown = Shutdown::new(self.notify_shutdown.subscribe());
        tokio::spawn(async move {
            tokio::select! {
                _ = time::sleep(delay) => {
                    // a timer may wait for room in the queue, it is not on the receive loop
                    if sender.send(task).await.is_err() {
                        debug!("worker pool closed before scheduled task ran");
                    }
                }
                _ = shutdown.recv() => {
                    trace!("scheduled task cancelled by shutdown");
                }
            }
        });
    }
}

/// A fixed number of workers draining one bounded queue, watched by a
/// monitor that restarts any worker that died.
#[derive(Debug)]
pub struct WorkerPool<T> {
    queue: TaskQueue<T>,
}

/// represent a running worker
#[derive(Debug)]
struct Worker {
    id: usize,
    handle: JoinHandle<()>,
}

impl<T: Send + 'static> WorkerPool<T> {
    /// `handler_factory` receives the pool's own [`TaskQueue`], so the handler
    /// can queue follow-up tasks without holding the pool itself.
    pub fn new<H, F>(config: WorkerPoolConfig, notify_shutdown: broadcast::Sender<()>, handler_factory: F) -> Self
    where
        H: PoolHandler<T>,
        F: FnOnce(TaskQueue<T>) -> H,
    {
        let (sender, receiver) = async_channel::bounded(config.channel_capacity.max(1));
        let queue = TaskQueue {
            sender,
            notify_shutdown: notify_shutdown.clone(),
        };
        let handler = handler_factory(queue.clone());

        let workers = (0..config.workers.max(1))
            .map(|id| Self::spawn_worker(id, handler.clone(), notify_shutdown.clone(), receiver.clone()))
            .collect();
        Self::spawn_monitor(workers, receiver, notify_shutdown, handler, config);

        Self { queue }
    }

    pub fn queue(&self) -> TaskQueue<T> {
        self.queue.clone()
    }

    pub fn submit(&self, task: T) -> AppResult<()> {
        self.queue.submit(task)
    }

    pub fn schedule(&self, task: T, delay: Duration) {
        self.queue.schedule(task, delay)
    }

    /// Stops accepting tasks. Workers stop on the shutdown signal.
    pub fn close(&self) {
        self.queue.sender.close();
    }

    fn spawn_worker<H: PoolHandler<T>>(
        id: usize,
        handler: H,
        notify_shutdown: broadcast::Sender<()>,
        receiver: async_channel::Receiver<T>,
    ) -> Worker {
        let mut shutdown = Shutdown::new(notify_shutdown.subscribe());

        let handle = tokio::spawn(async move {
            debug!("Worker {id} started");

            loop {
                tokio::select! {
                    Ok(task) = receiver.recv() => {
                        handler.handle(task).await;
                    }
                    _ = shutdown.recv() => {
                        debug!("Worker {id} shutting down");
                        break;
                    }
                }
            }
        });

        Worker { id, handle }
    }

    fn spawn_monitor<H: PoolHandler<T>>(
        mut workers: Vec<Worker>,
        receiver: async_channel::Receiver<T>,
        notify_shutdown: broadcast::Sender<()>,
        handler: H,
        config: WorkerPoolConfig,
    ) {
        tokio::spawn(async move {
            let mut interval = time::interval(config.monitor_interval);
            let mut shutdown = Shutdown::new(notify_shutdown.subscribe());

            loop {
                tokio::select! {
                    _ = shutdown.recv() => {
                        debug!("Worker monitor received shutdown signal");
                        break;
                    }
                    _ = interval.tick() => {
                        for worker in &mut workers {
                            match time::timeout(config.worker_check_timeout, &mut worker.handle).await {
                                Ok(join_result) => {
                                    match join_result {
                                        Ok(_) => {
                                            warn!("Worker {} completed unexpectedly", worker.id);
                                        }
                                        Err(err) => {
                                            if err.is_panic() {
                                                log_worker_panic(worker.id, err);
                                            } else {
                                                error!("Worker {} failed with non-panic error", worker.id);
                                            }
                                        }
                                    }

                                    warn!("Worker {} failed, restarting...", worker.id);
                                    *worker = Self::spawn_worker(
                                        worker.id,
                                        handler.clone(),
                                        notify_shutdown.clone(),
                                        receiver.clone(),
                                    );
                                    debug!("Worker {} restarted", worker.id);
                                }
                                Err(_) => {
                                    trace!("Worker {} is running", worker.id);
                                }
                            }
                        }
                    }
                }
            }
            debug!("Worker monitor exiting");
        });
    }
}

fn log_worker_panic(worker_id: usize, err: tokio::task::JoinError) {
    let payload = err.into_panic();
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        error!("Worker {worker_id} panicked with message: {message}");
    } else if let Some(message) = payload.downcast_ref::<String>() {
        error!("Worker {worker_id} panicked with message: {message}");
    } else {
        error!(
            "Worker {worker_id} panicked with an unknown type: {}",
            get_type_name(&payload)
        );
    }
}

#[inline]
fn get_type_name<R>(_: &R) -> &'static str {
    type_name::<R>()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicI32, Ordering};
    use std::sync::Arc;

    use super::*;

    #[derive(Clone)]
    struct TestHandler {
        counter: Arc<AtomicI32>,
    }

    impl PoolHandler<i32> for TestHandler {
        fn handle(&self, task: i32) -> impl Future<Output = ()> + Send {
            let counter = self.counter.clone();
            async move {
                counter.fetch_add(task, Ordering::SeqCst);
            }
        }
    }

    fn test_config(workers: usize, channel_capacity: usize) -> WorkerPoolConfig {
        WorkerPoolConfig {
            workers,
            channel_capacity,
            monitor_interval: Duration::from_millis(100),
            worker_check_timeout: Duration::from_millis(50),
        }
    }

    #[tokio::test]
    async fn test_worker_pool() {
        let (notify_shutdown, _) = broadcast::channel(1);
        let counter = Arc::new(AtomicI32::new(0));
        let handler = TestHandler {
            counter: counter.clone(),
        };

        let pool = WorkerPool::new(test_config(2, 10), notify_shutdown, |_| handler);

        pool.submit(1).unwrap();
        pool.submit(2).unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_worker_panic_recovery() {
        let (notify_shutdown, _) = broadcast::channel(1);
        let counter = Arc::new(AtomicI32::new(0));

        #[derive(Clone)]
        struct PanicHandler {
            counter: Arc<AtomicI32>,
        }

        impl PoolHandler<bool> for PanicHandler {
            fn handle(&self, should_panic: bool) -> impl Future<Output = ()> + Send {
                let counter = self.counter.clone();
                async move {
                    if should_panic {
                        panic!("Test panic");
                    }
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            }
        }

        let handler = PanicHandler {
            counter: counter.clone(),
        };
        let pool = WorkerPool::new(test_config(1, 10), notify_shutdown, |_| handler);

        pool.submit(true).unwrap();

        // wait for the monitor to restart the worker
        tokio::time::sleep(Duration::from_millis(300)).await;

        pool.submit(false).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn full_queue_rejects_instead_of_blocking() {
        let (notify_shutdown, _) = broadcast::channel(1);

        #[derive(Clone)]
        struct SlowHandler;

        impl PoolHandler<i32> for SlowHandler {
            fn handle(&self, _task: i32) -> impl Future<Output = ()> + Send {
                time::sleep(Duration::from_secs(5))
            }
        }

        let pool = WorkerPool::new(test_config(1, 1), notify_shutdown, |_| SlowHandler);
        pool.submit(1).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        pool.submit(2).unwrap();

        let err = pool.submit(3).unwrap_err();
        assert!(matches!(err, AppError::ChannelSendError(_)));
    }

    #[tokio::test]
    async fn scheduled_task_runs_after_delay() {
        let (notify_shutdown, _) = broadcast::channel(1);
        let counter = Arc::new(AtomicI32::new(0));
        let handler = TestHandler {
            counter: counter.clone(),
        };
        let pool = WorkerPool::new(test_config(1, 10), notify_shutdown, |_| handler);

        pool.schedule(5, Duration::from_millis(100));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn shutdown_cancels_scheduled_tasks() {
        let (notify_shutdown, _) = broadcast::channel(1);
        let counter = Arc::new(AtomicI32::new(0));
        let handler = TestHandler {
            counter: counter.clone(),
        };
        let pool = WorkerPool::new(test_config(1, 10), notify_shutdown.clone(), |_| handler);

        pool.schedule(5, Duration::from_millis(100));
        tokio::time::sleep(Duration::from_millis(10)).await;
        notify_shutdown.send(()).unwrap();
        pool.close();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert!(pool.submit(1).is_err());
    }

    #[tokio::test]
    async fn handler_can_queue_follow_up_work() {
        let (notify_shutdown, _) = broadcast::channel(1);
        let counter = Arc::new(AtomicI32::new(0));

        #[derive(Clone)]
        struct ChainHandler {
            queue: TaskQueue<i32>,
            counter: Arc<AtomicI32>,
        }

        impl PoolHandler<i32> for ChainHandler {
            fn handle(&self, task: i32) -> impl Future<Output = ()> + Send {
                let this = self.clone();
                async move {
                    this.counter.fetch_add(1, Ordering::SeqCst);
                    if task > 0 {
                        this.queue.submit(task - 1).unwrap();
                    }
                }
            }
        }

        let chain_counter = counter.clone();
        let pool = WorkerPool::new(test_config(2, 10), notify_shutdown, move |queue| ChainHandler {
            queue,
            counter: chain_counter,
        });
        pool.submit(3).unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }
}
