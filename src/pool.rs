//! Fixed-size worker pools with progress reporting and cooperative interruption.

use std::sync::atomic::{AtomicBool, Ordering};

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use rayon::prelude::*;
use tracing::{debug, warn};

use crate::error::AppError;

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Process-wide interrupt flag raised by SIGINT.
pub struct Interrupt;

impl Interrupt {
    /// Installs the SIGINT handler. A second interrupt terminates immediately.
    pub fn install() {
        if let Err(err) = install_sigint_handler() {
            warn!(error = %err, "could not install the interrupt handler");
        }
    }

    pub fn requested() -> bool {
        INTERRUPTED.load(Ordering::SeqCst)
    }

    pub fn raise() {
        INTERRUPTED.store(true, Ordering::SeqCst);
    }

    pub fn reset() {
        INTERRUPTED.store(false, Ordering::SeqCst);
    }
}

/// `SA_RESETHAND` restores the default action after the first delivery, so
/// the handler itself only touches the atomic flag.
#[cfg(unix)]
fn install_sigint_handler() -> Result<(), String> {
    use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};

    let action = SigAction::new(
        SigHandler::Handler(on_sigint),
        SaFlags::SA_RESETHAND,
        SigSet::empty(),
    );
    // SAFETY: the handler only stores to an atomic, which is async-signal-safe.
    unsafe { sigaction(Signal::SIGINT, &action) }.map_err(|errno| errno.to_string())?;
    debug!("registered SIGINT handler");
    Ok(())
}

#[cfg(not(unix))]
fn install_sigint_handler() -> Result<(), String> {
    Ok(())
}

#[cfg(unix)]
extern "C" fn on_sigint(_signal: nix::libc::c_int) {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

/// A pool of `threads` workers; one is built per pipeline stage.
pub struct WorkerPool {
    pool: rayon::ThreadPool,
    threads: usize,
    progress: bool,
}

impl WorkerPool {
    pub fn new(threads: usize, progress: bool) -> Result<Self, AppError> {
        let threads = threads.max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|index| format!("worker-{index}"))
            .build()?;
        debug!(threads, "spawned worker pool");
        Ok(Self { pool, threads, progress })
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Runs `task` over every item and blocks until all of them are done.
    ///
    /// Workers stop picking up new items once an interrupt is requested; an
    /// item already in flight runs to completion. Returns `Cancelled` when
    /// the list was cut short.
    pub fn process_list<T, F>(&self, label: &str, items: &[T], task: F) -> Result<(), AppError>
    where
        T: Sync,
        F: Fn(&T) + Sync + Send,
    {
        self.process_list_or_cancel(label, items, task, || {})
    }

    /// Like [`process_list`](Self::process_list), but the first worker to
    /// notice an interrupt calls `on_cancel` once, while the other workers
    /// may still be busy with their items.
    pub fn process_list_or_cancel<T, F, C>(
        &self,
        label: &str,
        items: &[T],
        task: F,
        on_cancel: C,
    ) -> Result<(), AppError>
    where
        T: Sync,
        F: Fn(&T) + Sync + Send,
        C: Fn() + Sync + Send,
    {
        if items.is_empty() {
            return Ok(());
        }
        let bar = self.progress_bar(label, items.len());
        let cancelled = AtomicBool::new(false);
        let notice_interrupt = || {
            if Interrupt::requested() && !cancelled.swap(true, Ordering::SeqCst) {
                warn!(stage = label, "caught interrupt, stopping workers");
                on_cancel();
            }
        };
        self.pool.install(|| {
            items.par_iter().with_max_len(1).for_each(|item| {
                notice_interrupt();
                if Interrupt::requested() {
                    return;
                }
                task(item);
                bar.inc(1);
                notice_interrupt();
            });
        });
        bar.finish_and_clear();

        if Interrupt::requested() {
            notice_interrupt();
            return Err(AppError::Cancelled);
        }
        debug!(stage = label, count = items.len(), "finished work list");
        Ok(())
    }

    fn progress_bar(&self, label: &str, len: usize) -> ProgressBar {
        if !self.progress {
            return ProgressBar::with_draw_target(Some(len as u64), ProgressDrawTarget::hidden());
        }
        let bar = ProgressBar::with_draw_target(Some(len as u64), ProgressDrawTarget::stderr());
        let template = "{prefix:>10} [{bar:30}] {pos}/{len} {elapsed}";
        if let Ok(style) = ProgressStyle::with_template(template) {
            bar.set_style(style.progress_chars("=> "));
        }
        bar.set_prefix(label.to_string());
        bar
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::{Duration, Instant};

    #[test]
    #[serial]
    fn processes_every_item_once() {
        Interrupt::reset();
        let pool = WorkerPool::new(3, false).unwrap();
        let seen = Mutex::new(Vec::new());
        let items: Vec<u32> = (0..25).collect();
        pool.process_list("test", &items, |item| seen.lock().unwrap().push(*item)).unwrap();
        let mut seen = seen.into_inner().unwrap();
        seen.sort();
        assert_eq!(seen, items);
    }

    #[test]
    #[serial]
    fn interrupt_stops_remaining_items() {
        Interrupt::reset();
        let pool = WorkerPool::new(1, false).unwrap();
        let done = AtomicUsize::new(0);
        let items: Vec<u32> = (0..10).collect();
        let result = pool.process_list("test", &items, |_| {
            done.fetch_add(1, Ordering::SeqCst);
            Interrupt::raise();
        });
        Interrupt::reset();
        assert!(matches!(result, Err(AppError::Cancelled)));
        assert!(done.load(Ordering::SeqCst) < items.len());
    }

    #[test]
    #[serial]
    fn cancel_hook_runs_once_while_other_items_are_in_flight() {
        Interrupt::reset();
        let pool = WorkerPool::new(2, false).unwrap();
        let hook_calls = AtomicUsize::new(0);
        let seen_by_busy_worker = AtomicBool::new(false);
        let items: Vec<u32> = vec![0, 1];

        let result = pool.process_list_or_cancel(
            "test",
            &items,
            |item| {
                if *item == 1 {
                    Interrupt::raise();
                    return;
                }
                // Item 0 stays busy until the hook has fired.
                let deadline = Instant::now() + Duration::from_secs(5);
                while Instant::now() < deadline {
                    if hook_calls.load(Ordering::SeqCst) > 0 {
                        seen_by_busy_worker.store(true, Ordering::SeqCst);
                        return;
                    }
                    thread::sleep(Duration::from_millis(5));
                }
            },
            || {
                hook_calls.fetch_add(1, Ordering::SeqCst);
            },
        );
        Interrupt::reset();

        assert!(matches!(result, Err(AppError::Cancelled)));
        assert_eq!(hook_calls.load(Ordering::SeqCst), 1);
        assert!(seen_by_busy_worker.load(Ordering::SeqCst));
    }

    #[test]
    #[serial]
    fn cancel_hook_is_not_called_without_interrupt() {
        Interrupt::reset();
        let pool = WorkerPool::new(2, false).unwrap();
        let hook_calls = AtomicUsize::new(0);
        let items: Vec<u32> = (0..5).collect();
        pool.process_list_or_cancel(
            "test",
            &items,
            |_| {},
            || {
                hook_calls.fetch_add(1, Ordering::SeqCst);
            },
        )
        .unwrap();
        assert_eq!(hook_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn zero_threads_still_builds_a_worker() {
        assert_eq!(WorkerPool::new(0, false).unwrap().threads(), 1);
    }
}
