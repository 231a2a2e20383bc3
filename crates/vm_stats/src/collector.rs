use anyhow::{Context as _, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use ticker::TaskHandle;

use crate::clock::Clock;
use crate::gc::{GcOverheadCalculator, GcStats};
use crate::heap_layout::{HeapLayout, HeapRegion};
use crate::hot_methods::HotMethodProfiler;
use crate::memory_pools::{MemoryPoolRates, PoolStats};
use crate::runtime::Runtime;
use crate::settings::CollectorSettings;
use crate::thread_usage::{ThreadUsage, ThreadUsageTracker};

/// Every metric group of one monitored runtime, built from the settings.
///
/// Memory and GC statistics need an identifiable heap layout; when it cannot
/// be discovered those groups are left out and the rest still runs.
pub struct Collector {
    settings: CollectorSettings,
    threads: Arc<ThreadUsageTracker>,
    hot_methods: Option<Arc<HotMethodProfiler>>,
    memory: Option<Arc<MemoryPoolRates>>,
    gc: Option<Arc<GcOverheadCalculator>>,
    tasks: Mutex<Vec<TaskHandle>>,
}

impl Collector {
    pub fn new(
        runtime: Arc<dyn Runtime>,
        clock: Arc<dyn Clock>,
        settings: CollectorSettings,
    ) -> Result<Self> {
        settings.validate().context("Invalid collector settings")?;

        let threads = Arc::new(ThreadUsageTracker::new(
            runtime.clone(),
            clock.clone(),
            &settings,
        ));
        let hot_methods = settings.hot_method_profiling.then(|| {
            Arc::new(HotMethodProfiler::new(
                runtime.clone(),
                clock.clone(),
                threads.top_threads().clone(),
                &settings,
            ))
        });
        let (memory, gc) = match HeapLayout::discover(runtime.as_ref()) {
            Ok(layout) => {
                let gc = GcOverheadCalculator::with_layout(runtime.clone(), clock.clone(), &layout);
                let memory = MemoryPoolRates::with_layout(runtime, clock, layout);
                (Some(Arc::new(memory)), Some(Arc::new(gc)))
            }
            Err(error) => {
                log::warn!("memory and gc statistics unavailable: {error}");
                (None, None)
            }
        };

        Ok(Self {
            settings,
            threads,
            hot_methods,
            memory,
            gc,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Runs one slow cycle on the calling thread: the thread pass first, so
    /// the hot method reduction sees this cycle's top threads, then memory
    /// and GC.
    pub fn tick(&self) {
        self.threads.update();
        if let Some(hot_methods) = &self.hot_methods {
            hot_methods.reduce_tick();
        }
        if let Some(memory) = &self.memory {
            memory.update();
        }
        if let Some(gc) = &self.gc {
            gc.update();
        }
    }

    /// Starts the periodic tasks: one per stats group at the poll interval
    /// and the stack sampler at the sample interval. If any task fails to
    /// start, the ones already started are stopped again.
    pub fn start(&self) -> Result<()> {
        let mut running = self.tasks.lock();
        anyhow::ensure!(running.is_empty(), "Collector is already running");

        let mut tasks = Vec::with_capacity(4);
        let poll = self.settings.poll_interval();
        let threads = self.threads.clone();
        let hot_methods = self.hot_methods.clone();
        tasks.push(ticker::spawn_periodic("vm-stats-threads", poll, move || {
            threads.update();
            if let Some(hot_methods) = &hot_methods {
                hot_methods.reduce_tick();
            }
        })?);
        if let Some(hot_methods) = self.hot_methods.clone() {
            tasks.push(ticker::spawn_periodic(
                "vm-stats-sampler",
                self.settings.sample_interval(),
                move || hot_methods.sample_tick(),
            )?);
        }
        if let Some(memory) = self.memory.clone() {
            tasks.push(ticker::spawn_periodic("vm-stats-memory", poll, move || {
                memory.update()
            })?);
        }
        if let Some(gc) = self.gc.clone() {
            tasks.push(ticker::spawn_periodic("vm-stats-gc", poll, move || {
                gc.update()
            })?);
        }
        log::info!("collector started {} periodic tasks", tasks.len());
        *running = tasks;
        Ok(())
    }

    /// Cancels the periodic tasks and waits for them to finish.
    pub fn stop(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock());
        if tasks.is_empty() {
            return;
        }
        for task in &tasks {
            task.cancel();
        }
        for task in tasks {
            task.join();
        }
        log::info!("collector stopped");
    }

    pub fn is_running(&self) -> bool {
        !self.tasks.lock().is_empty()
    }

    pub fn settings(&self) -> &CollectorSettings {
        &self.settings
    }

    pub fn threads(&self) -> &ThreadUsageTracker {
        &self.threads
    }

    pub fn thread_usage(&self) -> ThreadUsage {
        self.threads.usage()
    }

    pub fn hot_methods(&self) -> Option<&HotMethodProfiler> {
        self.hot_methods.as_deref()
    }

    pub fn memory(&self) -> Option<&MemoryPoolRates> {
        self.memory.as_deref()
    }

    pub fn pool_stats(&self, region: HeapRegion) -> Option<PoolStats> {
        self.memory.as_ref().map(|memory| memory.pool(region))
    }

    pub fn gc(&self) -> Option<&GcOverheadCalculator> {
        self.gc.as_deref()
    }

    pub fn gc_stats(&self) -> Option<GcStats> {
        self.gc.as_ref().map(|gc| gc.stats())
    }
}

impl Drop for Collector {
    fn drop(&mut self) {
        self.stop();
    }
}
