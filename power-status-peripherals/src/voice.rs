use std::sync::mpsc;
use std::thread::sleep;
use std::time::Duration;

use thiserror::Error;
use tokio::{
    sync::watch,
    task::{spawn_blocking, JoinHandle},
};

use crate::BackendError;

const SPEAKING_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
enum VoiceMessage {
    Say(String),
    Stop,
}

#[derive(Error, Clone, Debug)]
pub enum VoiceError {
    #[error("Could not initialize speech engine")]
    Initialization(#[source] BackendError),
    #[error("Could not send message to voice thread")]
    Send,
    #[error("Could not wait for voice thread to stop")]
    ThreadWait,
    #[error("Could not wait for processing notification")]
    ProcessingWait,
}

pub type Result<T> = std::result::Result<T, VoiceError>;

pub trait SpeechEngine {
    fn speak(&mut self, text: &str) -> std::result::Result<(), BackendError>;
    fn is_speaking(&self) -> bool;
}

/// Speech engine backed by the platform synthesizer.
pub struct SystemVoice {
    engine: tts::Tts,
}

impl SystemVoice {
    pub fn new() -> std::result::Result<SystemVoice, BackendError> {
        let engine = tts::Tts::default()?;
        Ok(SystemVoice { engine })
    }
}

impl SpeechEngine for SystemVoice {
    fn speak(&mut self, text: &str) -> std::result::Result<(), BackendError> {
        self.engine.speak(text, false)?;
        Ok(())
    }

    fn is_speaking(&self) -> bool {
        self.engine.is_speaking().unwrap_or(false)
    }
}

/// Best-effort speech queue. Utterances are spoken in submission order on a
/// dedicated thread; a failing engine mutes the queue instead of surfacing
/// errors to senders.
pub struct Voice {
    speak_handle: JoinHandle<()>,
    speak_sender: mpsc::Sender<VoiceMessage>,
    processing_receiver: watch::Receiver<bool>,
}

impl Voice {
    /// Starts the platform voice. Blocks until the engine reports ready or
    /// failed, so callers can emit their ready line afterwards.
    pub fn start() -> Result<Voice> {
        Self::with_engine(SystemVoice::new)
    }

    pub fn with_engine<E, F>(make_engine: F) -> Result<Voice>
    where
        E: SpeechEngine,
        F: FnOnce() -> std::result::Result<E, BackendError> + Send + 'static,
    {
        let (speak_sender, speak_receiver) = mpsc::channel();
        let (processing_sender, processing_receiver) = watch::channel(false);
        let (ready_sender, ready_receiver) = mpsc::channel();
        let speak_handle = spawn_blocking(move || {
            // the engine lives on this thread only, its handles need not be Send
            let mut engine = match make_engine() {
                Ok(engine) => {
                    if ready_sender.send(Ok(())).is_err() {
                        info!("voice ready receiver closed before startup finished");
                        return;
                    }
                    engine
                }
                Err(e) => {
                    let _ = ready_sender.send(Err(VoiceError::Initialization(e)));
                    return;
                }
            };
            info!("starting voice thread");
            let mut muted = false;
            loop {
                let next_msg = match speak_receiver.try_recv() {
                    Ok(msg) => {
                        trace!("next utterance was already queued");
                        msg
                    }
                    Err(e) => {
                        // notify if no message in queue
                        if let Err(e) = processing_sender.send(false) {
                            error!("error in voice thread while trying to set processing status to false: {}", e);
                            break;
                        }
                        match e {
                            mpsc::TryRecvError::Disconnected => {
                                info!("voice messaging channel disconnected");
                                break;
                            }
                            mpsc::TryRecvError::Empty => match speak_receiver.recv() {
                                Ok(msg) => msg,
                                Err(_) => {
                                    info!("voice messaging channel had no more messages");
                                    break;
                                }
                            },
                        }
                    }
                };
                if let Err(e) = processing_sender.send(true) {
                    error!("error in voice thread while trying to set processing status to true: {}", e);
                    break;
                }
                match next_msg {
                    VoiceMessage::Say(text) => {
                        if muted {
                            trace!("voice muted, dropping utterance");
                            continue;
                        }
                        trace!("speaking: {}", text);
                        if let Err(e) = engine.speak(&text) {
                            warn!("speech engine failed, continuing text-only: {}", e);
                            muted = true;
                            continue;
                        }
                        while engine.is_speaking() {
                            sleep(SPEAKING_POLL);
                        }
                    }
                    VoiceMessage::Stop => {
                        trace!("stopping voice thread");
                        break;
                    }
                }
            }
            info!("voice thread stopping");
        });

        match ready_receiver.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(VoiceError::ThreadWait),
        }

        Ok(Voice {
            speak_handle,
            speak_sender,
            processing_receiver,
        })
    }

    pub fn speak<S: Into<String>>(&self, text: S) -> Result<()> {
        self.speak_sender
            .send(VoiceMessage::Say(text.into()))
            .map_err(|_| VoiceError::Send)
    }

    /// Queued utterances are spoken before the thread exits.
    pub async fn shutdown(&mut self) -> Result<()> {
        trace!("shutting down voice");
        self.speak_sender
            .send(VoiceMessage::Stop)
            .map_err(|_| VoiceError::Send)?;
        (&mut self.speak_handle)
            .await
            .map_err(|_| VoiceError::ThreadWait)?;
        Ok(())
    }

    pub fn is_processing(&self) -> bool {
        *self.processing_receiver.borrow()
    }

    pub async fn wait_for_processing(&mut self) -> Result<()> {
        if self.is_processing() {
            self.processing_receiver
                .changed()
                .await
                .map_err(|_| VoiceError::ProcessingWait)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct RecordingEngine {
        spoken: Arc<Mutex<Vec<String>>>,
        fail: bool,
    }

    impl SpeechEngine for RecordingEngine {
        fn speak(&mut self, text: &str) -> std::result::Result<(), BackendError> {
            if self.fail {
                return Err(BackendError::new("engine gone"));
            }
            self.spoken.lock().unwrap().push(text.to_string());
            Ok(())
        }

        fn is_speaking(&self) -> bool {
            false
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn speaks_in_submission_order() {
        let engine = RecordingEngine::default();
        let spoken = engine.spoken.clone();
        let mut voice = Voice::with_engine(move || Ok(engine)).unwrap();

        voice.speak("first").unwrap();
        voice.speak("second").unwrap();
        voice.speak("third").unwrap();
        voice.shutdown().await.unwrap();

        assert_eq!(*spoken.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn init_failure_is_reported_to_the_caller() {
        let result = Voice::with_engine(|| -> std::result::Result<RecordingEngine, BackendError> {
            Err(BackendError::new("no synthesizer"))
        });
        assert!(matches!(result, Err(VoiceError::Initialization(_))));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failing_engine_mutes_without_erroring_senders() {
        let engine = RecordingEngine {
            fail: true,
            ..RecordingEngine::default()
        };
        let spoken = engine.spoken.clone();
        let mut voice = Voice::with_engine(move || Ok(engine)).unwrap();

        voice.speak("dropped").unwrap();
        voice.speak("also dropped").unwrap();
        voice.shutdown().await.unwrap();

        assert!(spoken.lock().unwrap().is_empty());
    }
}
