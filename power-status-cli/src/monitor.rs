use std::time::{Duration, Instant};

use itertools::Itertools;
use power_status_peripherals::power::types::{Reading, Supply};
use power_status_peripherals::power::{self, Power, PowerError};
use power_status_peripherals::voice::{Voice, VoiceError};
use sysinfo::{Pid, ProcessRefreshKind, System};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::term::{self, Command, Keys, TermError};

const INTERVAL_STEP: Duration = Duration::from_millis(500);
const MIN_INTERVAL: Duration = Duration::from_millis(500);
const MAX_INTERVAL: Duration = Duration::from_secs(60);

pub const HELP_TEXT: &str = "ESC/Q: Quit | H: Help | < or ,: Poll faster | > or .: Poll slower | R: Toggle repeat | C: Say current status | S: Status line";

#[derive(Error, Debug)]
#[error("Polling interval must be a positive number of seconds")]
pub struct InvalidInterval;

#[derive(Error, Debug)]
pub enum MonitorError {
    #[error(transparent)]
    Power(#[from] PowerError),
    #[error(transparent)]
    Voice(#[from] VoiceError),
    #[error(transparent)]
    Term(#[from] TermError),
}

/// Run-time configuration, owned and mutated by the monitor loop alone.
#[derive(Clone, Debug)]
pub struct MonitorConfig {
    poll_interval: Duration,
    repeat_enabled: bool,
    percent_threshold: Option<u8>,
}

impl MonitorConfig {
    pub fn new(
        interval_secs: f64,
        percent_threshold: Option<u8>,
        repeat_enabled: bool,
    ) -> Result<MonitorConfig, InvalidInterval> {
        if !interval_secs.is_finite() || interval_secs <= 0.0 {
            return Err(InvalidInterval);
        }
        Ok(MonitorConfig {
            poll_interval: Duration::from_secs_f64(interval_secs).clamp(MIN_INTERVAL, MAX_INTERVAL),
            repeat_enabled,
            percent_threshold,
        })
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn repeat_enabled(&self) -> bool {
        self.repeat_enabled
    }

    pub fn percent_threshold(&self) -> Option<u8> {
        self.percent_threshold
    }

    fn toggle_repeat(&mut self) -> bool {
        self.repeat_enabled = !self.repeat_enabled;
        self.repeat_enabled
    }

    fn faster(&mut self) -> Duration {
        self.poll_interval = self
            .poll_interval
            .saturating_sub(INTERVAL_STEP)
            .max(MIN_INTERVAL);
        self.poll_interval
    }

    fn slower(&mut self) -> Duration {
        self.poll_interval = (self.poll_interval + INTERVAL_STEP).min(MAX_INTERVAL);
        self.poll_interval
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Notice {
    Baseline(Reading),
    SupplyChanged { from: Supply, to: Reading },
    LevelChanged { from: u8, to: u8 },
}

impl Notice {
    pub fn console_line(&self) -> String {
        match self {
            Notice::Baseline(reading) => format!("Current power state: {}", reading),
            Notice::SupplyChanged { from, to } => {
                format!("Power source changed: {} → {}", from, to)
            }
            Notice::LevelChanged { from, to } => {
                format!("Battery level changed: {}% → {}%", from, to)
            }
        }
    }

    /// Phrasing handed to the synthesizer, without glyphs it would stumble on.
    pub fn spoken_line(&self) -> String {
        match self {
            Notice::Baseline(reading) => {
                format!("Power monitoring started. Current state: {}", reading.supply)
            }
            Notice::SupplyChanged { to, .. } => {
                format!("Power source changed: now on {}", to.supply)
            }
            Notice::LevelChanged { to, .. } => format!("Battery level now {} percent", to),
        }
    }
}

/// Last-known-state memory plus the change policy. The stored sample is
/// replaced on every observation whether or not it differed.
#[derive(Debug, Default)]
pub struct ChangeTracker {
    last: Option<Reading>,
    percent_threshold: Option<u8>,
}

impl ChangeTracker {
    pub fn new(percent_threshold: Option<u8>) -> ChangeTracker {
        ChangeTracker {
            last: None,
            percent_threshold,
        }
    }

    pub fn last(&self) -> Option<&Reading> {
        self.last.as_ref()
    }

    pub fn observe(&mut self, reading: Reading) -> Option<Notice> {
        let notice = match &self.last {
            None => Some(Notice::Baseline(reading.clone())),
            Some(last) if last.supply != reading.supply => Some(Notice::SupplyChanged {
                from: last.supply,
                to: reading.clone(),
            }),
            Some(last) => match (self.percent_threshold, last.percent, reading.percent) {
                (Some(threshold), Some(from), Some(to))
                    if threshold > 0 && from.abs_diff(to) >= threshold =>
                {
                    Some(Notice::LevelChanged { from, to })
                }
                _ => None,
            },
        };
        self.last = Some(reading);
        notice
    }
}

/// Process resource summary for the status line.
struct ResourceUsage {
    system: System,
    pid: Pid,
}

impl ResourceUsage {
    fn new() -> ResourceUsage {
        ResourceUsage {
            system: System::new(),
            pid: Pid::from_u32(std::process::id()),
        }
    }

    fn sample(&mut self) -> Option<(f64, f32)> {
        self.system.refresh_process_specifics(
            self.pid,
            ProcessRefreshKind::new().with_cpu().with_memory(),
        );
        let process = self.system.process(self.pid)?;
        Some((
            process.memory() as f64 / (1024.0 * 1024.0),
            process.cpu_usage(),
        ))
    }
}

fn format_clock(elapsed: Duration) -> String {
    let total = elapsed.as_secs();
    format!(
        "{:02}:{:02}:{:02}",
        total / 3600,
        (total % 3600) / 60,
        total % 60
    )
}

fn on_off(value: bool) -> &'static str {
    if value {
        "ON"
    } else {
        "OFF"
    }
}

pub struct Monitor {
    config: MonitorConfig,
    power: Power,
    voice: Option<Voice>,
    tracker: ChangeTracker,
    resources: ResourceUsage,
    started_at: Instant,
    state_since: Instant,
    last_status_line: Option<Instant>,
}

impl Monitor {
    pub fn new(config: MonitorConfig, power: Power, voice: Option<Voice>) -> Monitor {
        let tracker = ChangeTracker::new(config.percent_threshold());
        Monitor {
            config,
            power,
            voice,
            tracker,
            resources: ResourceUsage::new(),
            started_at: Instant::now(),
            state_since: Instant::now(),
            last_status_line: None,
        }
    }

    pub async fn run(mut self) -> Result<(), MonitorError> {
        let mut reading_receiver = self.power.subscribe();
        let (command_sender, mut command_receiver) = mpsc::unbounded_channel();
        let mut keys = Keys::start(command_sender)?;

        term::line(&format!(
            "Power monitor ready{}.",
            if self.voice.is_some() {
                ""
            } else {
                " (voice unavailable, console output only)"
            }
        ));
        term::line(HELP_TEXT);

        let result = loop {
            tokio::select! {
                changed = reading_receiver.changed() => {
                    if changed.is_err() {
                        break Err(MonitorError::Power(PowerError::ReadingReceive));
                    }
                    let reading = reading_receiver.borrow().clone();
                    self.on_reading(reading);
                }
                command = command_receiver.recv() => {
                    match command {
                        None => break Err(MonitorError::Term(TermError::KeysClosed)),
                        Some(command) => {
                            debug!("handling command {:?}", command);
                            if !self.on_command(command) {
                                break Ok(());
                            }
                        }
                    }
                }
            }
        };

        if let Err(e) = keys.stop().await {
            warn!("could not stop key reader cleanly: {}", e);
        }
        if let Err(e) = self.power.stop() {
            warn!("could not stop power reader cleanly: {}", e);
        }
        if let Some(voice) = self.voice.as_mut() {
            if let Err(e) = voice.shutdown().await {
                warn!("could not shut down voice cleanly: {}", e);
            }
        }
        term::line("Exiting...");
        result
    }

    fn on_reading(&mut self, reading: power::Result<Option<Reading>>) {
        match reading {
            Err(e) => {
                // recoverable: skip this cycle, keep the last known state
                warn!("power status unavailable, skipping cycle: {}", e);
            }
            Ok(None) => {}
            Ok(Some(reading)) => {
                if let Some(notice) = self.tracker.observe(reading) {
                    if matches!(notice, Notice::Baseline(_) | Notice::SupplyChanged { .. }) {
                        self.state_since = Instant::now();
                    }
                    self.announce(&notice);
                }
                self.maybe_status_line();
            }
        }
    }

    /// Returns false when the loop should exit.
    fn on_command(&mut self, command: Command) -> bool {
        match command {
            Command::Quit => return false,
            Command::Help => term::line(HELP_TEXT),
            Command::Faster => {
                let interval = self.config.faster();
                self.apply_interval(interval);
            }
            Command::Slower => {
                let interval = self.config.slower();
                self.apply_interval(interval);
            }
            Command::ToggleRepeat => {
                let enabled = self.config.toggle_repeat();
                term::line(&format!("Repeat mode: {}", on_off(enabled)));
                if enabled {
                    // courtesy announcement, without waiting for the next poll
                    self.announce_current();
                }
            }
            Command::SayCurrent => self.announce_current(),
            Command::PrintStatus => self.print_status_line(),
        }
        true
    }

    fn apply_interval(&mut self, interval: Duration) {
        term::line(&format!("Polling interval: {}s", interval.as_secs_f64()));
        if let Err(e) = self.power.set_rate(interval) {
            warn!("could not update polling rate: {}", e);
        }
    }

    fn announce(&mut self, notice: &Notice) {
        term::line(&notice.console_line());
        self.speak(&notice.spoken_line());
    }

    fn announce_current(&mut self) {
        match self.tracker.last().cloned() {
            Some(reading) => {
                term::line(&format!("Current power state: {}", reading));
                self.speak(&format!("Current power state: {}", reading.supply));
            }
            None => term::line("No power reading yet"),
        }
    }

    fn speak(&mut self, text: &str) {
        if let Some(voice) = &self.voice {
            if let Err(e) = voice.speak(text) {
                warn!(
                    "voice unavailable, continuing with console output only: {}",
                    e
                );
                self.voice = None;
            }
        }
    }

    fn maybe_status_line(&mut self) {
        if !self.config.repeat_enabled() {
            return;
        }
        let due = self
            .last_status_line
            .map(|at| at.elapsed() >= self.config.poll_interval())
            .unwrap_or(true);
        if due {
            self.print_status_line();
        }
    }

    fn print_status_line(&mut self) {
        let mut parts = vec![match self.tracker.last() {
            Some(reading) => format!("Power: {}", reading),
            None => "Power: Unknown".to_string(),
        }];
        parts.push(format!(
            "Current/Total: {}/{}",
            format_clock(self.state_since.elapsed()),
            format_clock(self.started_at.elapsed())
        ));
        parts.push(format!(
            "Polling: {}s",
            self.config.poll_interval().as_secs_f64()
        ));
        if let Some((mem_mb, cpu)) = self.resources.sample() {
            parts.push(format!("Mem: {:.1} MB", mem_mb));
            parts.push(format!("CPU: {:.1}%", cpu));
        }
        parts.push(format!("Repeat: {}", on_off(self.config.repeat_enabled())));
        parts.push("<H> for menu".to_string());
        term::status_line(&parts.iter().join(" | "));
        self.last_status_line = Some(Instant::now());
    }
}
