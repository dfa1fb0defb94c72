use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

type Task = Box<dyn FnOnce() + Send>;

/// Sink for work the buffer wants off its append path, such as ring cleanup.
///
/// When no executor is configured the work runs inline on the appending
/// thread.
pub trait TaskExecutor: Send + Sync + 'static {
    fn execute(&self, task: Task);
}

/// Cancellation handle for a scheduled one-shot task.
pub struct TaskHandle {
    cancelled: Arc<AtomicBool>,
}

impl TaskHandle {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }
}

struct Scheduled {
    due: Instant,
    cancelled: Arc<AtomicBool>,
    task: Task,
}

struct TimerShared {
    queue: Mutex<Vec<Scheduled>>,
    cond: Condvar,
    shutdown: AtomicBool,
}

/// One-shot task scheduler backed by a single worker thread.
///
/// Used for the auto-sync delay: the buffer schedules a task on the first
/// append that finds none pending, and the task clears the pending flag when
/// it fires so the next append can reschedule.
pub struct Timer {
    shared: Arc<TimerShared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Timer {
    pub fn new() -> Arc<Self> {
        let shared = Arc::new(TimerShared {
            queue: Mutex::new(Vec::new()),
            cond: Condvar::new(),
            shutdown: AtomicBool::new(false),
        });
        let worker_shared = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name("qring-timer".to_string())
            .spawn(move || run_timer(worker_shared))
            .expect("spawn timer thread");
        Arc::new(Self {
            shared,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Schedules `task` to run once, `delay` from now.
    pub fn schedule(&self, delay: Duration, task: Task) -> TaskHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        let scheduled = Scheduled {
            due: Instant::now() + delay,
            cancelled: Arc::clone(&cancelled),
            task,
        };
        if let Ok(mut queue) = self.shared.queue.lock() {
            queue.push(scheduled);
            self.shared.cond.notify_all();
        }
        TaskHandle { cancelled }
    }

    /// Stops the worker thread. Pending tasks are discarded.
    pub fn stop(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.cond.notify_all();
        if let Ok(mut handle) = self.handle.lock() {
            if let Some(handle) = handle.take() {
                let _ = handle.join();
            }
        }
    }
}

fn run_timer(shared: Arc<TimerShared>) {
    let mut queue = match shared.queue.lock() {
        Ok(queue) => queue,
        Err(_) => return,
    };
    loop {
        if shared.shutdown.load(Ordering::Acquire) {
            return;
        }
        let now = Instant::now();
        let next_due = queue
            .iter()
            .enumerate()
            .min_by_key(|(_, scheduled)| scheduled.due)
            .map(|(i, scheduled)| (i, scheduled.due));
        match next_due {
            Some((i, due)) if due <= now => {
                let scheduled = queue.swap_remove(i);
                drop(queue);
                if !scheduled.cancelled.load(Ordering::Acquire) {
                    (scheduled.task)();
                }
                queue = match shared.queue.lock() {
                    Ok(queue) => queue,
                    Err(_) => return,
                };
            }
            Some((_, due)) => {
                queue = match shared.cond.wait_timeout(queue, due - now) {
                    Ok((queue, _)) => queue,
                    Err(_) => return,
                };
            }
            None => {
                queue = match shared.cond.wait(queue) {
                    Ok(queue) => queue,
                    Err(_) => return,
                };
            }
        }
    }
}

/// Process-private timer shared by buffers that are not handed one explicitly.
pub(crate) fn shared_timer() -> Arc<Timer> {
    static SHARED: OnceLock<Arc<Timer>> = OnceLock::new();
    Arc::clone(SHARED.get_or_init(Timer::new))
}
