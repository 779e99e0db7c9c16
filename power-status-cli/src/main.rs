mod monitor;
mod term;

extern crate pretty_env_logger;
#[macro_use]
extern crate log;

use std::time::Duration;

use color_eyre::eyre::WrapErr;
use power_status_peripherals::power::Power;
use power_status_peripherals::voice::Voice;
use structopt::StructOpt;
use tokio::pin;
use tokio_stream::StreamExt;

use crate::monitor::{Monitor, MonitorConfig};

const STATUS_RATE: Duration = Duration::from_millis(500);

#[derive(StructOpt, Debug)]
enum Opt {
    /// Watch the power source and announce transitions
    Monitor {
        /// Seconds between polls
        #[structopt(default_value = "2")]
        interval: f64,

        /// Also announce battery level swings of at least this many percentage points
        #[structopt(short, long)]
        threshold: Option<u8>,

        /// Start with repeat mode on
        #[structopt(short, long)]
        repeat: bool,

        /// Console output only, no speech
        #[structopt(short, long)]
        mute: bool,
    },
    /// Print a single power reading
    Status,
    /// Speak a line of text through the voice engine
    Say {
        /// Text to speak
        text: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    pretty_env_logger::init();
    color_eyre::install()?;

    let opts = Opt::from_args();

    debug!("opts: {:?}", opts);

    match opts {
        Opt::Monitor {
            interval,
            threshold,
            repeat,
            mute,
        } => {
            let config = MonitorConfig::new(interval, threshold, repeat)?;
            let voice = if mute {
                None
            } else {
                println!("Initializing voice engine...");
                match Voice::start() {
                    Ok(voice) => Some(voice),
                    Err(e) => {
                        warn!(
                            "voice engine not available, continuing with console output only: {}",
                            e
                        );
                        None
                    }
                }
            };
            let power = Power::start(config.poll_interval())
                .wrap_err("Could not read platform power status")?;
            Monitor::new(config, power, voice).run().await?;
        }
        Opt::Status => {
            let power = Power::start(STATUS_RATE)?;
            let reading_stream = power.reading_stream();
            pin!(reading_stream);
            while let Some(reading) = reading_stream.next().await {
                if let Some(reading) = reading? {
                    println!("Power: {}", reading);
                    break;
                }
            }
            power.stop()?;
        }
        Opt::Say { text } => {
            let mut voice = Voice::start()?;
            voice.speak(text)?;
            voice.shutdown().await?;
            println!("Finished speaking!");
        }
    }

    Ok(())
}
