use std::{
    error::Error,
    process,
    time::{Duration, Instant},
};

use clap::{command, Parser, ValueHint};
use log::{debug, error, info, warn, LevelFilter};
use rodio::OutputStream;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::mpsc,
    time::MissedTickBehavior,
};
use veil::Redact;

use espwifi_player::{
    config::Config,
    events::Event,
    gateway::Gateway,
    output::RodioSink,
    player::Player,
    protocol::media::Filesystem,
    remote::WsTransport,
    signal::{Handler, ShutdownSignal},
    state::CastState,
};

/// Profile to display when not built in release mode.
#[cfg(debug_assertions)]
const BUILD_PROFILE: &str = "debug";
/// Profile to display when not built release mode.
#[cfg(not(debug_assertions))]
const BUILD_PROFILE: &str = "release";

/// Group name for mutually exclusive logging options.
const ARGS_GROUP_LOGGING: &str = "logging";

/// How often the audio output reports its position.
const POLL_INTERVAL: Duration = Duration::from_millis(250);

const HELP: &str = "commands: list, play [N], pause, toggle, stop, next, prev, \
                    seek SECONDS, vol 0..1, cast STATE, status, quit";

type Engine = Player<WsTransport, RodioSink>;

/// Command line arguments as parsed by `clap`.
#[derive(Clone, Parser, Redact)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file
    ///
    /// Settings given on the command line take precedence. A missing file
    /// means all defaults.
    #[arg(short, long, value_name = "FILE", value_hint = ValueHint::FilePath, default_value_t = String::from("espwifi.toml"))]
    config: String,

    /// Device host name or address, optionally with a port
    #[arg(long, value_hint = ValueHint::Hostname, env = "ESPWIFI_HOST")]
    host: Option<String>,

    /// Connect using TLS
    #[arg(long, default_value_t = false)]
    secure: bool,

    /// Device access token
    ///
    /// Prefer the environment variable over the command line, where other
    /// users may see it.
    #[arg(long, env = "ESPWIFI_TOKEN", hide_env_values = true)]
    #[redact]
    token: Option<String>,

    /// Storage to play from: sd or lfs
    #[arg(long)]
    fs: Option<Filesystem>,

    /// Directory to list tracks from
    #[arg(short, long, value_name = "DIR")]
    music_dir: Option<String>,

    /// Chunk size to request from the device, in bytes
    #[arg(long, value_name = "BYTES")]
    chunk_size: Option<u32>,

    /// Bytes to request with each pull after the first chunk
    ///
    /// The device picks its own read size when unset.
    #[arg(long, value_name = "BYTES")]
    max_bytes: Option<u32>,

    /// Bytes to buffer before decoding starts
    #[arg(long, value_name = "BYTES")]
    prefetch: Option<usize>,

    /// Milliseconds after a stop during which audio errors are ignored
    #[arg(long, value_name = "MS")]
    stop_grace: Option<u64>,

    /// Initial volume between 0.0 and 1.0
    #[arg(long)]
    volume: Option<f32>,

    /// Suppresses all output except warnings and errors.
    #[arg(short, long, default_value_t = false, group = ARGS_GROUP_LOGGING)]
    quiet: bool,

    /// Enable verbose logging
    ///
    /// Specify twice for trace logging.
    #[arg(short, long, action = clap::ArgAction::Count, group = ARGS_GROUP_LOGGING)]
    verbose: u8,
}

impl Args {
    /// Applies command line overrides on top of the configuration file.
    fn configure(&self, config: &mut Config) {
        if let Some(host) = &self.host {
            config.host.clone_from(host);
        }
        if self.secure {
            config.secure = true;
        }
        if self.token.is_some() {
            config.token.clone_from(&self.token);
        }
        if let Some(fs) = self.fs {
            config.fs = fs;
        }
        if let Some(music_dir) = &self.music_dir {
            config.music_dir.clone_from(music_dir);
        }
        if let Some(chunk_size) = self.chunk_size {
            config.chunk_size = chunk_size;
        }
        if self.max_bytes.is_some() {
            config.max_bytes = self.max_bytes;
        }
        if let Some(prefetch) = self.prefetch {
            config.prefetch = prefetch;
        }
        if let Some(stop_grace) = self.stop_grace {
            config.stop_grace = stop_grace;
        }
        if let Some(volume) = self.volume {
            config.volume = volume;
        }
    }
}

/// Initializes the logger facade.
///
/// The logging level is determined as follows, in order of precedence from
/// highest to lowest:
/// 1. Command line arguments
/// 2. `RUST_LOG` environment variable
/// 3. Hard coded default
///
/// # Panics
///
/// Panics when a logger facade is already initialized.
fn init_logger(config: &Args) {
    let mut logger = env_logger::Builder::from_env(
        // Note: if you change the default logging level here, then you should
        // probably also change the verbosity levels below.
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
    );

    if config.quiet || config.verbose > 0 {
        let level = match config.verbose {
            0 => {
                // Quiet and verbose are mutually exclusive, and `verbose` is 0
                // by default. So this arm means: quiet mode.
                LevelFilter::Warn
            }
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        };

        // Filter log messages of external crates.
        logger.filter_module(module_path!(), level);
    }

    logger.init();
}

/// Fetches the track list again. The current track keeps playing.
async fn refresh(gateway: &Gateway, dir: &str, player: &mut Engine) {
    match gateway.list(dir).await {
        Ok(tracks) => player.set_tracks(tracks),
        Err(e) => error!("failed to list {dir}: {e}"),
    }
}

fn report(player: &Engine, event: Event) {
    match event {
        Event::PlaybackChanged {
            is_playing: true, ..
        } => {
            let track = player.current().and_then(|index| player.tracks().get(index));
            match track {
                Some(track) => info!("now playing {track}"),
                None => info!("playing"),
            }
        }
        Event::PlaybackChanged { is_paused: true, .. } => info!("paused"),
        Event::PlaybackChanged { .. } => info!("{}", player.state().status),
        Event::TrackChanged { index } => debug!("selected track {index}"),
        Event::Failed => error!(
            "failed: {}",
            player.state().last_error.as_deref().unwrap_or("unknown error")
        ),
        Event::CastChanged(cast_state) => info!("cast {cast_state}"),
    }
}

fn status(player: &Engine) {
    let state = player.state();
    let track = player
        .current()
        .and_then(|index| player.tracks().get(index))
        .map_or_else(|| "-".to_owned(), ToString::to_string);
    let duration = state
        .duration
        .map_or_else(|| "?".to_owned(), |duration| format!("{:.0}s", duration.as_secs_f64()));

    println!(
        "{} {track} {:.0}s/{duration} volume {:.0}% cast {}",
        state.status,
        player.display_time().as_secs_f64(),
        state.volume * 100.0,
        state.cast_state,
    );
}

enum Flow {
    Continue,
    Quit,
}

/// Runs one prompt command.
async fn execute(line: &str, gateway: &Gateway, dir: &str, player: &mut Engine) -> Flow {
    let mut words = line.split_whitespace();
    let Some(command) = words.next() else {
        return Flow::Continue;
    };
    let argument = words.next();

    match (command, argument) {
        ("list", _) => {
            refresh(gateway, dir, player).await;
            for (index, track) in player.tracks().iter().enumerate() {
                println!("{index:>3}  {track}");
            }
        }
        ("play", None) => player.play(Instant::now()),
        ("play", Some(number)) => match number.parse::<usize>() {
            Ok(index) => {
                if let Err(e) = player.select(index, Instant::now()) {
                    error!("{e}");
                }
            }
            Err(e) => warn!("invalid track number {number}: {e}"),
        },
        ("pause", _) => player.pause(),
        ("toggle", _) => player.toggle(Instant::now()),
        ("stop", _) => player.stop(Instant::now()),
        ("next", _) => player.next(Instant::now()),
        ("prev", _) => player.previous(Instant::now()),
        ("seek", Some(seconds)) => match seconds.parse::<f64>() {
            Ok(seconds) => {
                player.preview_seek(seconds);
                match player.seek(seconds) {
                    Some(position) => info!("seeked to {:.1}s", position.as_secs_f64()),
                    None => info!("seek deferred until the position is buffered"),
                }
            }
            Err(e) => warn!("invalid position {seconds}: {e}"),
        },
        ("vol", Some(volume)) => match volume.parse::<f32>() {
            Ok(volume) => {
                player.set_volume(volume);
            }
            Err(e) => warn!("invalid volume {volume}: {e}"),
        },
        ("cast", Some(cast_state)) => match cast_state.parse::<CastState>() {
            Ok(cast_state) => player.set_cast_state(cast_state),
            Err(e) => warn!("{e}"),
        },
        ("status", _) => status(player),
        ("quit" | "exit", _) => return Flow::Quit,
        _ => warn!("unknown command: {line}; {HELP}"),
    }

    Flow::Continue
}

/// Main application loop.
///
/// # Errors
///
/// Returns an error if the configuration is invalid, or the audio output or
/// signal handlers cannot be set up.
async fn run(args: Args) -> Result<(), Box<dyn Error>> {
    let mut config = Config::load(&args.config)?;
    args.configure(&mut config);
    config.validate()?;
    debug!("{config:#?}");

    let gateway = Gateway::new(&config)?;

    let (channel_tx, mut channel_rx) = mpsc::unbounded_channel();
    let (sink_tx, mut sink_rx) = mpsc::unbounded_channel();
    let (event_tx, mut event_rx) = mpsc::unbounded_channel();

    // Playback stops when the output stream is dropped.
    let (_stream, handle) = OutputStream::try_default()?;
    let sink = RodioSink::new(&handle, config.prefetch, sink_tx)?;
    let mut player = Player::new(&config, WsTransport::new(channel_tx), sink)?;
    player.register(event_tx);

    refresh(&gateway, &config.music_dir, &mut player).await;
    info!("{HELP}");

    let mut signals = Handler::new()?;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut ticker = tokio::time::interval(POLL_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    // Every branch runs to completion before the next event is looked at,
    // so the player never sees two events at once.
    loop {
        tokio::select! {
            // Prioritize shutdown signals.
            biased;

            signal = signals.recv() => {
                if signal == ShutdownSignal::Reload {
                    info!("received {signal}, listing tracks again");
                    refresh(&gateway, &config.music_dir, &mut player).await;
                } else {
                    info!("received {signal}, shutting down gracefully");
                    break;
                }
            }

            Some((id, event)) = channel_rx.recv() => player.handle_channel(id, event),

            Some((id, event)) = sink_rx.recv() => {
                player.handle_sink(id, event, Instant::now());
            }

            Some(event) = event_rx.recv() => report(&player, event),

            _ = ticker.tick() => player.sink_mut().poll(),

            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => {
                    if let Flow::Quit = execute(&line, &gateway, &config.music_dir, &mut player).await {
                        break;
                    }
                }
                Ok(None) => {
                    debug!("end of input, continuing until signalled");
                    stdin_open = false;
                }
                Err(e) => {
                    error!("failed to read input: {e}");
                    stdin_open = false;
                }
            },
        }
    }

    player.shutdown(Instant::now());
    Ok(())
}

/// Main entry point of the application.
///
/// This function initializes the logger facade, parses the command line
/// arguments, and starts the main application loop.
#[tokio::main]
async fn main() {
    // `clap` handles our command line arguments and help text.
    let args = Args::parse();
    init_logger(&args);

    // Dump command line arguments before we do anything more.
    // This aids in debugging of whatever comes next.
    debug!("Command {:#?}", args);

    let cmd = command!();
    let name = cmd.get_name().to_string();
    let version = cmd.get_version().unwrap_or("UNKNOWN").to_string();

    info!("starting {name}/{version}; {BUILD_PROFILE}");

    if let Err(e) = run(args).await {
        error!("{e}");
        process::exit(1);
    }
}
