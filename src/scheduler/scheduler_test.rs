use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::sleep;
use tracing_test::traced_test;

use super::*;
use crate::errors::Error;

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

#[derive(Default)]
struct Recorder {
    runs: AtomicUsize,
    hold: AtomicBool,
    release: Notify,
}

#[async_trait]
impl InvalidationHandler for Recorder {
    async fn on_invalidated(&self) -> crate::errors::Result<()> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        if self.hold.load(Ordering::SeqCst) {
            self.release.notified().await;
        }
        Ok(())
    }
}

struct Failing {
    runs: AtomicUsize,
}

#[async_trait]
impl InvalidationHandler for Failing {
    async fn on_invalidated(&self) -> crate::errors::Result<()> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        Err(Error::Fatal("handler failure".to_string()))
    }
}

struct Panicking;

#[async_trait]
impl InvalidationHandler for Panicking {
    async fn on_invalidated(&self) -> crate::errors::Result<()> {
        panic!("handler panic");
    }
}

#[tokio::test]
async fn signal_triggers_one_run() {
    let scheduler = InvalidationScheduler::start(2);
    let recorder = Arc::new(Recorder::default());
    let handle = scheduler.register(false, recorder.clone());

    assert_eq!(recorder.runs.load(Ordering::SeqCst), 0);
    handle.set();
    wait_until(|| recorder.runs.load(Ordering::SeqCst) == 1).await;

    handle.set();
    wait_until(|| recorder.runs.load(Ordering::SeqCst) == 2).await;
    scheduler.shutdown(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn initial_armed_registration_runs_immediately() {
    let scheduler = InvalidationScheduler::start(2);
    let recorder = Arc::new(Recorder::default());
    let _handle = scheduler.register(true, recorder.clone());

    wait_until(|| recorder.runs.load(Ordering::SeqCst) == 1).await;
    scheduler.shutdown(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn signals_during_run_coalesce_to_one_follow_up() {
    let scheduler = InvalidationScheduler::start(2);
    let recorder = Arc::new(Recorder::default());
    recorder.hold.store(true, Ordering::SeqCst);
    let handle = scheduler.register(false, recorder.clone());

    handle.set();
    wait_until(|| recorder.runs.load(Ordering::SeqCst) == 1).await;

    // The run is parked inside the handler; pile on signals.
    for _ in 0..5 {
        handle.set();
    }
    recorder.hold.store(false, Ordering::SeqCst);
    recorder.release.notify_one();

    wait_until(|| recorder.runs.load(Ordering::SeqCst) == 2).await;
    sleep(Duration::from_millis(50)).await;
    assert_eq!(recorder.runs.load(Ordering::SeqCst), 2);
    scheduler.shutdown(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn handler_error_does_not_stop_the_dispatcher() {
    let scheduler = InvalidationScheduler::start(2);
    let failing = Arc::new(Failing {
        runs: AtomicUsize::new(0),
    });
    let handle = scheduler.register(false, failing.clone());

    handle.set();
    wait_until(|| failing.runs.load(Ordering::SeqCst) == 1).await;
    handle.set();
    wait_until(|| failing.runs.load(Ordering::SeqCst) == 2).await;
    scheduler.shutdown(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
#[traced_test]
async fn handler_panic_is_contained() {
    let scheduler = InvalidationScheduler::start(2);
    let panicking = scheduler.register(false, Arc::new(Panicking));
    let recorder = Arc::new(Recorder::default());
    let healthy = scheduler.register(false, recorder.clone());

    panicking.set();
    healthy.set();
    wait_until(|| recorder.runs.load(Ordering::SeqCst) == 1).await;

    // The panicked entry can still be signaled without wedging anything.
    panicking.set();
    healthy.set();
    wait_until(|| recorder.runs.load(Ordering::SeqCst) == 2).await;
    scheduler.shutdown(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn unregister_stops_future_runs() {
    let scheduler = InvalidationScheduler::start(2);
    let recorder = Arc::new(Recorder::default());
    let handle = scheduler.register(false, recorder.clone());

    scheduler.unregister(&handle);
    handle.set();
    sleep(Duration::from_millis(50)).await;
    assert_eq!(recorder.runs.load(Ordering::SeqCst), 0);
    scheduler.shutdown(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn signal_enqueued_before_unregister_is_skipped() {
    let scheduler = InvalidationScheduler::start(1);
    let blocker = Arc::new(Recorder::default());
    blocker.hold.store(true, Ordering::SeqCst);
    let blocker_handle = scheduler.register(false, blocker.clone());
    let recorder = Arc::new(Recorder::default());
    let handle = scheduler.register(false, recorder.clone());

    // Occupy the single worker, then enqueue and immediately unregister.
    blocker_handle.set();
    wait_until(|| blocker.runs.load(Ordering::SeqCst) == 1).await;
    handle.set();
    scheduler.unregister(&handle);
    blocker.hold.store(false, Ordering::SeqCst);
    blocker.release.notify_one();

    sleep(Duration::from_millis(50)).await;
    assert_eq!(recorder.runs.load(Ordering::SeqCst), 0);
    scheduler.shutdown(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn distinct_entries_run_independently() {
    let scheduler = InvalidationScheduler::start(4);
    let first = Arc::new(Recorder::default());
    let second = Arc::new(Recorder::default());
    let first_handle = scheduler.register(false, first.clone());
    let second_handle = scheduler.register(false, second.clone());

    first_handle.set();
    second_handle.set();
    wait_until(|| {
        first.runs.load(Ordering::SeqCst) == 1 && second.runs.load(Ordering::SeqCst) == 1
    })
    .await;
    scheduler.shutdown(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn shutdown_is_bounded_and_signals_after_are_dropped() {
    let scheduler = InvalidationScheduler::start(2);
    let recorder = Arc::new(Recorder::default());
    let handle = scheduler.register(false, recorder.clone());

    scheduler.shutdown(Duration::from_secs(1)).await.unwrap();
    // Setting after shutdown must not panic or run anything.
    handle.set();
    sleep(Duration::from_millis(30)).await;
    assert_eq!(recorder.runs.load(Ordering::SeqCst), 0);
}
