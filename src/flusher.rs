use std::{
    sync::{mpsc::RecvTimeoutError, Arc},
    time::Duration,
};

use rand::{thread_rng, Rng};

use crate::{event_processor::EventProcessor, Error, Result};

/// Timing of the background flush loop.
#[derive(Debug, Clone, Copy)]
pub struct FlusherThreadConfig {
    /// Time between flushes.
    pub interval: Duration,
    /// Up to this much random delay is added to every interval.
    pub jitter: Duration,
}

impl FlusherThreadConfig {
    pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(5);
    pub const DEFAULT_JITTER: Duration = Duration::from_millis(500);
}

impl Default for FlusherThreadConfig {
    fn default() -> Self {
        FlusherThreadConfig {
            interval: FlusherThreadConfig::DEFAULT_INTERVAL,
            jitter: FlusherThreadConfig::DEFAULT_JITTER,
        }
    }
}

/// A thread that periodically publishes queued events.
///
/// Use [`Client::start_flusher_thread`](crate::Client::start_flusher_thread) to get an instance
/// of it. The thread exits by itself once the SDK key is rejected, and flushes one last time when
/// asked to stop.
pub struct FlusherThread {
    join_handle: std::thread::JoinHandle<()>,

    /// Used to send a stop command to the flusher thread.
    stop_sender: std::sync::mpsc::Sender<()>,
}

impl FlusherThread {
    pub(crate) fn start(
        processor: Arc<EventProcessor>,
        config: FlusherThreadConfig,
    ) -> Result<FlusherThread> {
        let (stop_sender, stop_receiver) = std::sync::mpsc::channel::<()>();

        let join_handle = std::thread::Builder::new()
            .name("flagship-flusher".to_owned())
            .spawn(move || loop {
                let timeout = jitter(config.interval, config.jitter);
                let stopping = match stop_receiver.recv_timeout(timeout) {
                    Err(RecvTimeoutError::Timeout) => false,
                    Ok(()) => {
                        log::debug!(target: "flagship", "flusher thread received stop command");
                        true
                    }
                    // The handle was dropped without stopping. Keep flushing on schedule.
                    Err(RecvTimeoutError::Disconnected) => {
                        std::thread::sleep(timeout);
                        false
                    }
                };

                match processor.flush() {
                    Err(Error::Unauthorized) => {
                        // Unauthorized is not recoverable. Stop the flusher thread.
                        log::warn!(target: "flagship", "stopping flusher thread, sdk_key was rejected");
                        return;
                    }
                    Err(err) => {
                        log::warn!(target: "flagship", "error while flushing events: {err}");
                    }
                    Ok(_) => {}
                }

                if stopping || processor.is_disabled() {
                    return;
                }
            })?;

        Ok(FlusherThread {
            join_handle,
            stop_sender,
        })
    }

    /// Stop the flusher thread.
    ///
    /// This function does not wait for the thread to actually stop.
    pub fn stop(&self) {
        // Error means that the receiver was dropped (thread exited). Ignoring it as there's nothing
        // useful we can do.
        let _ = self.stop_sender.send(());
    }

    /// Stop the flusher thread and block waiting for it to exit, including its final flush.
    ///
    /// If you don't need to wait for the thread to exit, use [`FlusherThread::stop`] instead.
    pub fn shutdown(self) -> Result<()> {
        self.stop();

        self.join_handle
            .join()
            .map_err(|_| Error::FlusherThreadPanicked)?;

        Ok(())
    }
}

/// Apply a random jitter to `interval`.
fn jitter(interval: Duration, jitter: Duration) -> Duration {
    if jitter.is_zero() {
        return interval;
    }
    interval + thread_rng().gen_range(Duration::ZERO..jitter)
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        time::Duration,
    };

    use super::{jitter, FlusherThread, FlusherThreadConfig};
    use crate::{
        event::{Event, IdentifyEvent},
        event_processor::EventProcessor,
        Error, EventPublisher, EventSerializer, Result, User,
    };

    struct CountingPublisher {
        calls: AtomicUsize,
        unauthorized: bool,
    }

    impl EventPublisher for CountingPublisher {
        fn publish(&self, _payload: &[u8]) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.unauthorized {
                Err(Error::Unauthorized)
            } else {
                Ok(())
            }
        }
    }

    fn setup(unauthorized: bool) -> (Arc<CountingPublisher>, Arc<EventProcessor>) {
        let publisher = Arc::new(CountingPublisher {
            calls: AtomicUsize::new(0),
            unauthorized,
        });
        let processor = Arc::new(EventProcessor::new(
            publisher.clone(),
            EventSerializer::default(),
            100,
        ));
        (publisher, processor)
    }

    fn identify() -> Event {
        Event::Identify(IdentifyEvent {
            creation_date: 0,
            key: "u1".to_owned(),
            user: User::new("u1"),
        })
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let interval = Duration::from_secs(5);
        for _ in 0..100 {
            let value = jitter(interval, Duration::from_millis(500));
            assert!(value >= interval && value < interval + Duration::from_millis(500));
        }
        assert_eq!(jitter(interval, Duration::ZERO), interval);
    }

    #[test]
    fn shutdown_flushes_remaining_events() {
        let (publisher, processor) = setup(false);
        let thread = FlusherThread::start(
            processor.clone(),
            FlusherThreadConfig {
                interval: Duration::from_secs(3600),
                jitter: Duration::ZERO,
            },
        )
        .unwrap();

        processor.enqueue(identify());
        thread.shutdown().unwrap();

        assert_eq!(publisher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(processor.queued_event_count(), 0);
    }

    #[test]
    fn exits_after_unauthorized() {
        let (publisher, processor) = setup(true);
        processor.enqueue(identify());

        let thread = FlusherThread::start(
            processor.clone(),
            FlusherThreadConfig {
                interval: Duration::from_millis(1),
                jitter: Duration::ZERO,
            },
        )
        .unwrap();

        std::thread::sleep(Duration::from_millis(50));
        thread.shutdown().unwrap();

        assert!(processor.is_disabled());
        assert_eq!(publisher.calls.load(Ordering::SeqCst), 1);
    }
}
