use std::io::{self, Write};
use std::time::Duration;

use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind};
use crossterm::terminal;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::watch;
use tokio::task::{spawn_blocking, JoinHandle};

const KEY_POLL: Duration = Duration::from_millis(100);

#[derive(Error, Debug)]
pub enum TermError {
    #[error("Could not switch terminal mode")]
    RawMode(#[source] io::Error),
    #[error("Could not send stop to key reader")]
    Send,
    #[error("Could not wait for key reader thread to stop")]
    ThreadWait,
    #[error("Key reader stopped unexpectedly")]
    KeysClosed,
}

pub type Result<T> = std::result::Result<T, TermError>;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Command {
    Quit,
    Help,
    Faster,
    Slower,
    ToggleRepeat,
    SayCurrent,
    PrintStatus,
}

impl Command {
    pub fn from_key(key: &KeyEvent) -> Option<Command> {
        if key.kind == KeyEventKind::Release {
            return None;
        }
        match key.code {
            KeyCode::Esc => Some(Command::Quit),
            KeyCode::Char(c) => match c.to_ascii_lowercase() {
                'q' => Some(Command::Quit),
                'h' => Some(Command::Help),
                '<' | ',' => Some(Command::Faster),
                '>' | '.' => Some(Command::Slower),
                'r' => Some(Command::ToggleRepeat),
                'c' => Some(Command::SayCurrent),
                's' => Some(Command::PrintStatus),
                _ => None,
            },
            _ => None,
        }
    }
}

/// Raw mode single-key reader. Commands are pushed to the channel the moment
/// the key is pressed; the thread checks for stop every poll slice.
#[derive(Debug)]
pub struct Keys {
    read_handle: JoinHandle<()>,
    read_stop_sender: watch::Sender<bool>,
}

impl Keys {
    pub fn start(command_sender: UnboundedSender<Command>) -> Result<Keys> {
        terminal::enable_raw_mode().map_err(TermError::RawMode)?;
        let (read_stop_sender, read_stop_receiver) = watch::channel(false);
        let read_handle = spawn_blocking(move || {
            info!("starting key reader thread");
            loop {
                if *read_stop_receiver.borrow() {
                    trace!("stopping key reader thread");
                    break;
                }
                match event::poll(KEY_POLL) {
                    Ok(false) => {}
                    Ok(true) => match event::read() {
                        Ok(Event::Key(key)) => {
                            if let Some(command) = Command::from_key(&key) {
                                trace!("decoded key command {:?}", command);
                                if command_sender.send(command).is_err() {
                                    info!("key command receiver closed");
                                    break;
                                }
                            }
                        }
                        Ok(_) => {}
                        Err(e) => {
                            error!("could not read terminal event: {}", e);
                            break;
                        }
                    },
                    Err(e) => {
                        error!("could not poll terminal events: {}", e);
                        break;
                    }
                }
            }
            info!("key reader thread stopping");
        });
        Ok(Keys {
            read_handle,
            read_stop_sender,
        })
    }

    pub async fn stop(&mut self) -> Result<()> {
        self.read_stop_sender
            .send(true)
            .map_err(|_| TermError::Send)?;
        (&mut self.read_handle)
            .await
            .map_err(|_| TermError::ThreadWait)?;
        if let Err(e) = terminal::disable_raw_mode() {
            warn!("could not restore terminal mode: {}", e);
        }
        Ok(())
    }
}

impl Drop for Keys {
    fn drop(&mut self) {
        let _ = terminal::disable_raw_mode();
    }
}

/// Prints a persistent line while the terminal is in raw mode.
pub fn line(text: &str) {
    print!("\r\n{}\r\n", text);
    let _ = io::stdout().flush();
}

/// Rewrites the transient status line in place.
pub fn status_line(text: &str) {
    print!("\r{}", text);
    let _ = io::stdout().flush();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossterm::event::KeyModifiers;

    fn press(code: KeyCode) -> KeyEvent {
        KeyEvent::new(code, KeyModifiers::NONE)
    }

    #[test]
    fn decodes_the_command_table() {
        assert_eq!(Command::from_key(&press(KeyCode::Esc)), Some(Command::Quit));
        assert_eq!(
            Command::from_key(&press(KeyCode::Char('q'))),
            Some(Command::Quit)
        );
        assert_eq!(
            Command::from_key(&press(KeyCode::Char('h'))),
            Some(Command::Help)
        );
        assert_eq!(
            Command::from_key(&press(KeyCode::Char('<'))),
            Some(Command::Faster)
        );
        assert_eq!(
            Command::from_key(&press(KeyCode::Char(','))),
            Some(Command::Faster)
        );
        assert_eq!(
            Command::from_key(&press(KeyCode::Char('>'))),
            Some(Command::Slower)
        );
        assert_eq!(
            Command::from_key(&press(KeyCode::Char('.'))),
            Some(Command::Slower)
        );
        assert_eq!(
            Command::from_key(&press(KeyCode::Char('r'))),
            Some(Command::ToggleRepeat)
        );
        assert_eq!(
            Command::from_key(&press(KeyCode::Char('c'))),
            Some(Command::SayCurrent)
        );
        assert_eq!(
            Command::from_key(&press(KeyCode::Char('s'))),
            Some(Command::PrintStatus)
        );
    }

    #[test]
    fn decoding_is_case_insensitive() {
        assert_eq!(
            Command::from_key(&press(KeyCode::Char('R'))),
            Some(Command::ToggleRepeat)
        );
        assert_eq!(
            Command::from_key(&press(KeyCode::Char('Q'))),
            Some(Command::Quit)
        );
    }

    #[test]
    fn unknown_keys_decode_to_nothing() {
        assert_eq!(Command::from_key(&press(KeyCode::Char('x'))), None);
        assert_eq!(Command::from_key(&press(KeyCode::Enter)), None);
        assert_eq!(Command::from_key(&press(KeyCode::F(1))), None);
    }

    #[test]
    fn release_events_are_ignored() {
        let release = KeyEvent::new_with_kind(
            KeyCode::Char('q'),
            KeyModifiers::NONE,
            KeyEventKind::Release,
        );
        assert_eq!(Command::from_key(&release), None);
    }
}
