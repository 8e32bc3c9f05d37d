//! Umbra CLI: play and record network radio, optionally over Tor or I2P

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread;

use clap::{Parser, ValueEnum};
use tracing::warn;
use tracing_subscriber::EnvFilter;

use umbra::audio::OutputKind;
use umbra::events::ServiceEvent;
use umbra::playback::NetworkBackend;
use umbra::routing::{ProxyKind, StreamTarget};
use umbra_app::connectivity::AppRouting;
use umbra_app::data::{ForceMode, Settings};
use umbra_app::service::{format_duration, ServiceHandle, ServiceParts, StreamingService};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ProxyArg {
    None,
    Tor,
    I2p,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ForceArg {
    Off,
    TorAll,
    TorExceptI2p,
    Custom,
    CustomExceptTorI2p,
}

impl From<ForceArg> for ForceMode {
    fn from(arg: ForceArg) -> Self {
        match arg {
            ForceArg::Off => ForceMode::Off,
            ForceArg::TorAll => ForceMode::TorAll,
            ForceArg::TorExceptI2p => ForceMode::TorExceptI2p,
            ForceArg::Custom => ForceMode::CustomProxy,
            ForceArg::CustomExceptTorI2p => ForceMode::CustomProxyExceptTorI2p,
        }
    }
}

#[derive(Parser)]
#[command(name = "umbra", about = "Privacy-aware network radio player and recorder", version)]
struct Cli {
    /// Stream URL to play on startup
    url: Option<String>,

    /// Station name shown and used for recording file names
    #[arg(short, long, default_value = "Unknown Station")]
    name: String,

    /// Proxy the station itself requires
    #[arg(long, value_enum, default_value_t = ProxyArg::None)]
    proxy: ProxyArg,

    /// Host of the station's proxy (defaults to the local Tor/I2P endpoint)
    #[arg(long)]
    proxy_host: Option<String>,

    /// Port of the station's proxy
    #[arg(long)]
    proxy_port: Option<u16>,

    /// Override the saved anonymity mode for this run
    #[arg(long, value_enum)]
    force: Option<ForceArg>,

    /// Start recording as soon as playback starts
    #[arg(short, long)]
    record: bool,

    /// Stop after this many minutes
    #[arg(long)]
    sleep: Option<u32>,

    /// Drain the stream without opening an audio device
    #[arg(long)]
    silent: bool,

    /// Settings file (defaults to the user config directory)
    #[arg(long)]
    settings: Option<PathBuf>,
}

impl Cli {
    fn target(&self, url: &str) -> StreamTarget {
        let target = StreamTarget::new(url, self.name.clone());
        let (kind, host, port) = match self.proxy {
            ProxyArg::None => return target,
            ProxyArg::Tor => (
                ProxyKind::Tor,
                umbra::config::proxy::DEFAULT_TOR_HOST,
                umbra::config::proxy::DEFAULT_TOR_PORT,
            ),
            ProxyArg::I2p => (
                ProxyKind::I2p,
                umbra::config::proxy::DEFAULT_I2P_HOST,
                umbra::config::proxy::DEFAULT_I2P_PORT,
            ),
        };
        target.with_proxy(
            kind,
            self.proxy_host.clone().unwrap_or_else(|| host.to_string()),
            self.proxy_port.unwrap_or(port),
        )
    }
}

/// One line typed at the prompt
#[derive(Debug, PartialEq)]
enum Input {
    Play { url: String, name: Option<String> },
    Pause,
    Resume,
    Stop,
    Record(Option<String>),
    StopRecording,
    Switch(String),
    Sleep(u32),
    Volume(f32),
    Status,
    Help,
    Quit,
}

fn parse_input(line: &str) -> Result<Input, String> {
    let line = line.trim();
    let (cmd, rest) = match line.split_once(char::is_whitespace) {
        Some((cmd, rest)) => (cmd, rest.trim()),
        None => (line, ""),
    };
    let arg = (!rest.is_empty()).then(|| rest.to_string());

    match cmd {
        "play" | "p" => {
            let mut parts = rest.splitn(2, char::is_whitespace);
            let url = parts.next().filter(|u| !u.is_empty()).ok_or("usage: play <url> [name]")?;
            Ok(Input::Play {
                url: url.to_string(),
                name: parts.next().map(|n| n.trim().to_string()).filter(|n| !n.is_empty()),
            })
        }
        "pause" => Ok(Input::Pause),
        "resume" => Ok(Input::Resume),
        "stop" | "s" => Ok(Input::Stop),
        "rec" | "record" => Ok(Input::Record(arg)),
        "unrec" => Ok(Input::StopRecording),
        "switch" => arg.map(Input::Switch).ok_or_else(|| "usage: switch <url>".to_string()),
        "sleep" => rest
            .parse()
            .map(Input::Sleep)
            .map_err(|_| "usage: sleep <minutes> (0 cancels)".to_string()),
        "vol" | "volume" => rest
            .parse::<u32>()
            .map(|v| Input::Volume(v.min(100) as f32 / 100.0))
            .map_err(|_| "usage: vol <0-100>".to_string()),
        "status" | "st" => Ok(Input::Status),
        "help" | "?" => Ok(Input::Help),
        "quit" | "q" | "exit" => Ok(Input::Quit),
        "" => Err(String::new()),
        other => Err(format!("unknown command '{other}', try 'help'")),
    }
}

const HELP: &str = "\
commands:
  play <url> [name]   play a stream
  pause | resume      pause or resume playback
  stop                stop playback, recording and the sleep timer
  rec [name]          record the current stream
  unrec               stop recording
  switch <url>        continue the recording from another stream
  sleep <minutes>     stop after a while (0 cancels)
  vol <0-100>         set the volume
  status              show what is going on
  quit";

fn print_event(event: &ServiceEvent) {
    match event {
        ServiceEvent::MetadataChanged(title) => println!("♪ {title}"),
        ServiceEvent::StreamInfoChanged { bitrate_bps, codec } => {
            let codec = codec.as_deref().unwrap_or("unknown codec");
            match bitrate_bps {
                Some(bps) => println!("stream: {codec} {} kbps", bps / 1000),
                None => println!("stream: {codec}"),
            }
        }
        ServiceEvent::PlaybackStateChanged {
            is_buffering,
            is_playing,
        } => match (is_buffering, is_playing) {
            (true, _) => println!("buffering..."),
            (false, true) => println!("playing"),
            (false, false) => println!("not playing"),
        },
        ServiceEvent::StreamError(kind) => println!("error: {kind}"),
        ServiceEvent::AudioFocusLost(loss) => println!("audio focus lost ({loss:?})"),
        ServiceEvent::RecordingStateChanged(state) => println!("recording: {state}"),
        ServiceEvent::RecordingStarted { location } => println!("recording to {location}"),
        ServiceEvent::RecordingError(message) => println!("recording error: {message}"),
        ServiceEvent::RecordingComplete { path, size_bytes } => {
            println!("saved {} ({} KB)", path.display(), size_bytes / 1024)
        }
        ServiceEvent::SleepTimerExpired => println!("sleep timer expired"),
        // Shown by `status`; too frequent to print
        ServiceEvent::TrafficUpdated { .. } => {}
    }
}

fn print_status(handle: &ServiceHandle) {
    let s = handle.snapshot();
    println!("playback:  {}", s.playback);
    if let Some(station) = &s.station_name {
        println!("station:   {station}");
    }
    if let Some(title) = &s.title {
        println!("title:     {title}");
    }
    println!("volume:    {}%", (s.volume * 100.0).round());
    println!("recording: {} ({} KB)", s.recording, s.recording_bytes / 1024);
    println!("traffic:   {} KB", s.network_bytes / 1024);
    if let Some(location) = &s.recording_location {
        println!("file:      {location}");
    }
    if s.sleep_timer_minutes > 0 {
        println!(
            "sleep:     {} ({}s left)",
            format_duration(s.sleep_timer_minutes),
            s.sleep_timer_remaining_secs
        );
    }
    if let Some(err) = &s.last_error {
        println!("last error: {err}");
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    let loaded = match &cli.settings {
        Some(path) => Settings::load_from(path),
        None => Settings::load(),
    };
    let mut settings = loaded.unwrap_or_else(|e| {
        warn!(error = %e, "Using default settings");
        Settings::default()
    });
    if let Some(force) = cli.force {
        settings.force_mode = force.into();
    }
    let settings = Arc::new(Mutex::new(settings));

    let routing = Arc::new(AppRouting::spawn(settings.clone())?);
    let output = if cli.silent {
        OutputKind::Silent
    } else {
        OutputKind::best_available()
    };
    let parts = ServiceParts::new(settings.clone(), routing.clone());
    let traffic = parts.traffic.clone();
    let (service, handle) = StreamingService::new(parts, |notify| {
        Ok(NetworkBackend::new(output, notify)?.with_meter(traffic))
    })?;

    let events = handle.subscribe();
    thread::Builder::new()
        .name("event-printer".into())
        .spawn(move || {
            for event in events.iter() {
                print_event(&event);
            }
        })?;
    let service_thread = service.spawn()?;

    if let Some(url) = &cli.url {
        handle.play(cli.target(url))?;
        if cli.record {
            handle.start_recording(cli.name.clone())?;
        }
    }
    if let Some(minutes) = cli.sleep {
        handle.set_sleep_timer(minutes)?;
    }

    println!("umbra {} - type 'help' for commands", env!("CARGO_PKG_VERSION"));
    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = line?;
        let input = match parse_input(&line) {
            Ok(input) => input,
            Err(msg) => {
                if !msg.is_empty() {
                    println!("{msg}");
                }
                continue;
            }
        };
        match input {
            Input::Play { url, name } => {
                let mut target = cli.target(&url);
                if let Some(name) = name {
                    target.station_name = name;
                }
                handle.play(target)?;
            }
            Input::Pause => handle.pause()?,
            Input::Resume => handle.resume()?,
            Input::Stop => handle.stop()?,
            Input::Record(name) => handle.start_recording(name.unwrap_or_default())?,
            Input::StopRecording => handle.stop_recording()?,
            Input::Switch(url) => handle.switch_recording_stream(cli.target(&url))?,
            Input::Sleep(minutes) => handle.set_sleep_timer(minutes)?,
            Input::Volume(volume) => handle.set_volume(volume)?,
            Input::Status => {
                routing.refresh();
                print_status(&handle);
            }
            Input::Help => println!("{HELP}"),
            Input::Quit => break,
        }
        io::stdout().flush()?;
    }

    handle.shutdown()?;
    if service_thread.join().is_err() {
        warn!("Streaming service thread panicked");
    }

    let settings = settings.lock().unwrap_or_else(|e| e.into_inner()).clone();
    let saved = match &cli.settings {
        Some(path) => settings.save_to(path),
        None => settings.save(),
    };
    if let Err(e) = saved {
        warn!(error = %e, "Could not save settings");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_play_with_and_without_name() {
        assert_eq!(
            parse_input("play http://a/s").unwrap(),
            Input::Play {
                url: "http://a/s".into(),
                name: None
            }
        );
        assert_eq!(
            parse_input("  play http://a/s   Late Night Jazz ").unwrap(),
            Input::Play {
                url: "http://a/s".into(),
                name: Some("Late Night Jazz".into())
            }
        );
        assert!(parse_input("play").is_err());
    }

    #[test]
    fn parses_recording_commands() {
        assert_eq!(parse_input("rec").unwrap(), Input::Record(None));
        assert_eq!(
            parse_input("rec Morning Show").unwrap(),
            Input::Record(Some("Morning Show".into()))
        );
        assert_eq!(parse_input("unrec").unwrap(), Input::StopRecording);
        assert_eq!(
            parse_input("switch http://b/s").unwrap(),
            Input::Switch("http://b/s".into())
        );
        assert!(parse_input("switch").is_err());
    }

    #[test]
    fn parses_numbers() {
        assert_eq!(parse_input("sleep 30").unwrap(), Input::Sleep(30));
        assert!(parse_input("sleep soon").is_err());
        assert_eq!(parse_input("vol 50").unwrap(), Input::Volume(0.5));
        assert_eq!(parse_input("vol 250").unwrap(), Input::Volume(1.0));
    }

    #[test]
    fn blank_and_unknown_lines() {
        assert_eq!(parse_input("   "), Err(String::new()));
        assert!(parse_input("dance").unwrap_err().contains("dance"));
    }

    #[test]
    fn station_proxy_defaults_to_local_daemon() {
        let cli = Cli::parse_from(["umbra", "--proxy", "i2p", "http://radio.i2p/live"]);
        let target = cli.target("http://radio.i2p/live");
        assert_eq!(target.proxy_kind, ProxyKind::I2p);
        assert_eq!(target.proxy_host, "127.0.0.1");
        assert_eq!(target.proxy_port, 4444);

        let cli = Cli::parse_from(["umbra", "--proxy", "tor", "--proxy-port", "9150"]);
        let target = cli.target("http://x.onion/");
        assert_eq!(target.proxy_kind, ProxyKind::Tor);
        assert_eq!(target.proxy_port, 9150);
    }

    #[test]
    fn force_modes_map() {
        assert_eq!(ForceMode::from(ForceArg::TorAll), ForceMode::TorAll);
        assert_eq!(
            ForceMode::from(ForceArg::CustomExceptTorI2p),
            ForceMode::CustomProxyExceptTorI2p
        );
    }
}
