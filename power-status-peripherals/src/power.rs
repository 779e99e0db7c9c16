use std::sync::{mpsc, Mutex};
use std::thread::sleep;

use async_stream::try_stream;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::spawn_blocking;
use tokio::time::{Duration, Instant};
use tokio_stream::Stream;

use crate::power::types::{BatteryProbe, PowerProbe, ProbeError, Reading};

pub mod types;

pub const DEFAULT_READ_RATE: Duration = Duration::from_secs(2);

#[derive(Clone, Debug)]
pub enum ReaderMessage {
    Start,
    Pause,
    SetRate(Duration),
    Stop,
}

#[derive(Error, Clone, Debug)]
pub enum PowerError {
    #[error(transparent)]
    Probe(#[from] ProbeError),
    #[error("Could not communicate with power reader thread")]
    Send,
    #[error("Could not acquire message sender mutex")]
    Mutex,
    #[error("Could not receive next reading")]
    ReadingReceive,
}

pub type Result<T> = std::result::Result<T, PowerError>;

/// Background power sampler. Readings are `Ok(None)` until the first sample
/// lands and while the reader is paused.
#[derive(Debug)]
pub struct Power {
    reading_receiver: watch::Receiver<Result<Option<Reading>>>,
    message_sender: Mutex<mpsc::Sender<ReaderMessage>>,
}

impl Power {
    pub fn start(rate: Duration) -> Result<Power> {
        Ok(Self::with_probe(BatteryProbe::new()?, rate))
    }

    pub fn default_rate() -> Result<Power> {
        Self::start(DEFAULT_READ_RATE)
    }

    pub fn with_probe<P: PowerProbe>(probe: P, rate: Duration) -> Power {
        let (message_sender, message_receiver) = mpsc::channel();
        let reading_receiver = Self::start_reading(probe, message_receiver, rate);

        Power {
            reading_receiver,
            message_sender: Mutex::new(message_sender),
        }
    }

    fn start_reading<P: PowerProbe>(
        mut probe: P,
        message_receiver: mpsc::Receiver<ReaderMessage>,
        mut rate: Duration,
    ) -> watch::Receiver<Result<Option<Reading>>> {
        let (reading_sender, reading_receiver) = watch::channel(Ok(None));

        spawn_blocking(move || {
            let mut running = true;
            let mut next_tick = Instant::now() + rate;
            loop {
                let now = Instant::now();
                if now < next_tick {
                    trace!("sleeping {:?}", next_tick - now);
                    sleep(next_tick - now);
                } else {
                    info!("next tick already surpassed, might need to increase read rate");
                }
                next_tick += rate;

                if reading_sender.receiver_count() <= 1 {
                    trace!("skipping due to no reading receivers");
                    continue;
                }

                let mut stopped = false;
                loop {
                    match message_receiver.try_recv() {
                        Ok(ReaderMessage::Stop) => {
                            info!("power reader thread received stop signal");
                            stopped = true;
                            break;
                        }
                        Err(mpsc::TryRecvError::Empty) => {
                            break;
                        }
                        Err(mpsc::TryRecvError::Disconnected) => {
                            info!("power reader message sender closed before stop signal");
                            return;
                        }
                        Ok(ReaderMessage::Pause) => {
                            info!("power reader thread pausing");
                            running = false;
                        }
                        Ok(ReaderMessage::Start) => {
                            info!("power reader thread starting");
                            running = true;
                        }
                        Ok(ReaderMessage::SetRate(new_rate)) => {
                            info!("power reader thread switching to rate {:?}", new_rate);
                            next_tick = next_tick - rate + new_rate;
                            rate = new_rate;
                        }
                    }
                }
                if stopped {
                    break;
                }

                let reading = if running {
                    probe.read().map(Some).map_err(PowerError::Probe)
                } else {
                    trace!("skip reading");
                    Ok(None)
                };

                if reading_sender.send(reading).is_err() {
                    info!("sent to no reading receivers");
                }
            }
        });

        reading_receiver
    }

    pub fn subscribe(&self) -> watch::Receiver<Result<Option<Reading>>> {
        self.reading_receiver.clone()
    }

    pub fn reading_stream(&self) -> impl Stream<Item = Result<Option<Reading>>> {
        let mut receiver = self.reading_receiver.clone();
        try_stream! {
            loop {
                receiver.changed().await.map_err(|_| PowerError::ReadingReceive)?;
                let next = receiver.borrow().clone()?;
                yield next;
            }
        }
    }

    pub fn pause(&self) -> Result<()> {
        self.message_sender
            .lock()
            .map_err(|_| PowerError::Mutex)?
            .send(ReaderMessage::Pause)
            .map_err(|_| PowerError::Send)
    }

    pub fn restart(&self) -> Result<()> {
        self.message_sender
            .lock()
            .map_err(|_| PowerError::Mutex)?
            .send(ReaderMessage::Start)
            .map_err(|_| PowerError::Send)
    }

    pub fn set_rate(&self, rate: Duration) -> Result<()> {
        self.message_sender
            .lock()
            .map_err(|_| PowerError::Mutex)?
            .send(ReaderMessage::SetRate(rate))
            .map_err(|_| PowerError::Send)
    }

    pub fn stop(&self) -> Result<()> {
        self.message_sender
            .lock()
            .map_err(|_| PowerError::Mutex)?
            .send(ReaderMessage::Stop)
            .map_err(|_| PowerError::Send)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::power::types::{ProbeResult, Supply};

    struct ScriptedProbe {
        script: Vec<ProbeResult<Reading>>,
    }

    impl ScriptedProbe {
        fn new(script: Vec<ProbeResult<Reading>>) -> ScriptedProbe {
            ScriptedProbe { script }
        }
    }

    impl PowerProbe for ScriptedProbe {
        fn read(&mut self) -> ProbeResult<Reading> {
            if self.script.is_empty() {
                Ok(Reading::now(Supply::Ac, Some(100)))
            } else {
                self.script.remove(0)
            }
        }
    }

    const TEST_RATE: Duration = Duration::from_millis(50);

    #[tokio::test(flavor = "multi_thread")]
    async fn publishes_scripted_readings_in_order() {
        let power = Power::with_probe(
            ScriptedProbe::new(vec![
                Ok(Reading::now(Supply::Battery, Some(87))),
                Err(ProbeError::Indeterminate),
                Ok(Reading::now(Supply::Ac, Some(95))),
            ]),
            TEST_RATE,
        );
        let mut receiver = power.subscribe();

        receiver.changed().await.unwrap();
        let first = receiver.borrow().clone().unwrap().unwrap();
        assert_eq!(first.supply, Supply::Battery);
        assert_eq!(first.percent, Some(87));

        // a failed poll is published, not fatal
        receiver.changed().await.unwrap();
        assert!(receiver.borrow().clone().is_err());

        // and the next poll proceeds normally
        receiver.changed().await.unwrap();
        let third = receiver.borrow().clone().unwrap().unwrap();
        assert_eq!(third.supply, Supply::Ac);
        assert_eq!(third.percent, Some(95));

        power.stop().unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn paused_reader_publishes_empty_readings() {
        let power = Power::with_probe(ScriptedProbe::new(Vec::new()), TEST_RATE);
        let mut receiver = power.subscribe();
        power.pause().unwrap();

        let paused = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                receiver.changed().await.unwrap();
                if receiver.borrow().clone().unwrap().is_none() {
                    break;
                }
            }
        })
        .await;
        assert!(paused.is_ok());

        power.stop().unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stop_ends_reader_thread() {
        let power = Power::with_probe(ScriptedProbe::new(Vec::new()), TEST_RATE);
        let mut receiver = power.subscribe();
        receiver.changed().await.unwrap();
        power.stop().unwrap();

        let closed = tokio::time::timeout(Duration::from_secs(2), async {
            while receiver.changed().await.is_ok() {}
        })
        .await;
        assert!(closed.is_ok());
    }
}
