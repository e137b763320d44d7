//! keytone-keys - Terminal keyboard instrument
//!
//! Plays notes and chords from the computer keyboard through a keytone
//! instrument.

use anyhow::Result;
use clap::{Parser, Subcommand};
use crossterm::{
    event::{
        Event, EventStream, KeyCode, KeyEvent, KeyEventKind, KeyModifiers,
        KeyboardEnhancementFlags, PopKeyboardEnhancementFlags, PushKeyboardEnhancementFlags,
    },
    execute,
    terminal::{
        disable_raw_mode, enable_raw_mode, supports_keyboard_enhancement, EnterAlternateScreen,
        LeaveAlternateScreen,
    },
};
use futures::future::join_all;
use futures::StreamExt;
use ratatui::prelude::*;
use std::io::{self, stdout};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinError, JoinSet};

use keytone_core::{CommandChannel, Handle, Instrument, VoiceBackend};
use keytone_keys::{
    config::{Config, KeyboardLayout, Theme},
    keyboard::{KeyPress, VirtualKeyboard, MAX_BASE_OCTAVE, MIN_BASE_OCTAVE},
    midi::{list_jack_midi_ports, MidiBackend},
    ui::{render_status, EventLog, StatusView},
};

/// How long shutdown waits for in-flight plays and releases
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

#[derive(Parser)]
#[command(name = "keytone-keys")]
#[command(author, version, about = "Play notes and chords from your computer keyboard", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Config file path (default: ~/.config/keytone-keys/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Use US QWERTY layout regardless of the config file
    #[arg(long)]
    us_layout: bool,

    /// Octave played by the lowest key (default 5)
    #[arg(short, long, allow_negative_numbers = true)]
    octave: Option<i32>,

    /// Note length in milliseconds, -1 holds notes until key-up
    #[arg(long, allow_negative_numbers = true)]
    note_ms: Option<i64>,

    /// JACK client name
    #[arg(long)]
    client_name: Option<String>,

    /// MIDI channel (0-15)
    #[arg(long)]
    channel: Option<u8>,

    /// Velocity (1-127)
    #[arg(long)]
    velocity: Option<u8>,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a default configuration file
    Init,
    /// Show the configuration file path
    ConfigPath,
    /// List available JACK MIDI ports
    ListPorts,
}

impl Cli {
    fn apply_overrides(&self, config: &mut Config) {
        if self.us_layout {
            config.keyboard.layout = KeyboardLayout::Us;
        }
        if let Some(octave) = self.octave {
            config.keyboard.base_octave = octave.clamp(MIN_BASE_OCTAVE, MAX_BASE_OCTAVE);
        }
        if let Some(note_ms) = self.note_ms {
            config.keyboard.note_ms = note_ms;
        }
        if let Some(ref name) = self.client_name {
            config.midi.client_name = name.clone();
        }
        if let Some(channel) = self.channel {
            config.midi.channel = channel.min(15);
        }
        if let Some(velocity) = self.velocity {
            config.midi.velocity = velocity.clamp(1, 127);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Init) => {
            let path = Config::create_default_config_file()?;
            println!("Created default config at: {}", path.display());
            return Ok(());
        }
        Some(Commands::ConfigPath) => {
            let path = Config::config_path()?;
            println!("{}", path.display());
            return Ok(());
        }
        Some(Commands::ListPorts) => {
            let ports = list_jack_midi_ports()?;
            if ports.is_empty() {
                println!("No JACK MIDI input ports found");
            } else {
                println!("Available JACK MIDI input ports:");
                for port in ports {
                    println!("  {}", port);
                }
            }
            return Ok(());
        }
        None => {}
    }

    let mut config = match cli.config {
        Some(ref path) => Config::load_from(path)?,
        None => Config::load_or_default(),
    };
    cli.apply_overrides(&mut config);

    run_tui(config).await
}

/// Result of a spawned play or release
enum Outcome {
    Played {
        identity: String,
        handles: Vec<Handle>,
        finite: bool,
    },
    PlayFailed {
        identity: String,
        error: String,
    },
    Released {
        label: String,
        count: usize,
    },
}

enum Step {
    Input(Option<io::Result<Event>>),
    Finished(std::result::Result<Outcome, JoinError>),
}

struct App {
    keyboard: VirtualKeyboard,
    instrument: Arc<Instrument>,
    events: EventLog,
    tasks: JoinSet<Outcome>,
    release_events: bool,
}

impl App {
    fn view(&self) -> StatusView<'_> {
        StatusView {
            keyboard: &self.keyboard,
            instrument_id: self.instrument.id(),
            backend: self.instrument.backend_name(),
            release_events: self.release_events,
            events: &self.events,
        }
    }

    /// Returns true when the user asked to quit.
    fn handle_key(&mut self, key: KeyEvent) -> bool {
        match key.kind {
            KeyEventKind::Press => {}
            KeyEventKind::Release => {
                if let KeyCode::Char(c) = key.code {
                    if let Some(handles) = self.keyboard.key_up(c) {
                        self.release(format!("key {}", c), handles);
                    }
                }
                return false;
            }
            _ => return false,
        }

        match key.code {
            KeyCode::Esc => return true,
            KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => return true,
            KeyCode::Char(c) if self.keyboard.config.is_keyboard_char(c) => {
                if let Some(press) = self.keyboard.key_down(c) {
                    self.play(press);
                }
            }
            // Octave down: < or Left arrow
            KeyCode::Left | KeyCode::Char('<') => {
                let released = self.keyboard.octave_down();
                self.events.push(format!("octave {}", self.keyboard.octave_name()));
                self.release("octave change".to_string(), released);
            }
            // Octave up: > or Right arrow
            KeyCode::Right | KeyCode::Char('>') => {
                let released = self.keyboard.octave_up();
                self.events.push(format!("octave {}", self.keyboard.octave_name()));
                self.release("octave change".to_string(), released);
            }
            _ => {}
        }
        false
    }

    fn play(&mut self, press: KeyPress) {
        self.events.push(format!("play {}", press.identity));
        let instrument = self.instrument.clone();
        let finite = press.is_finite();
        self.tasks.spawn(async move {
            match instrument.play(press.source).await {
                Ok(played) => Outcome::Played {
                    identity: press.identity,
                    handles: played.handles(),
                    finite,
                },
                Err(e) => Outcome::PlayFailed {
                    identity: press.identity,
                    error: e.to_string(),
                },
            }
        });
    }

    fn release(&mut self, label: String, handles: Vec<Handle>) {
        if handles.is_empty() {
            return;
        }
        let instrument = self.instrument.clone();
        self.tasks.spawn(async move {
            let results = join_all(handles.iter().map(|&handle| instrument.release(handle))).await;
            let mut count = 0;
            for (handle, result) in handles.iter().zip(results) {
                match result {
                    Ok(true) => count += 1,
                    Ok(false) => {}
                    Err(e) => log::warn!("Release of handle {} failed: {}", handle, e),
                }
            }
            Outcome::Released { label, count }
        });
    }

    fn apply(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Played {
                identity,
                handles,
                finite: true,
            } => {
                self.keyboard.finished(&identity);
                log::debug!("{} ended after {:?}", identity, handles);
            }
            Outcome::Played {
                identity,
                handles,
                finite: false,
            } => {
                // Key went up while the play was in flight
                if !self.keyboard.sounding(&identity, handles.clone()) {
                    self.release(identity, handles);
                }
            }
            Outcome::PlayFailed { identity, error } => {
                self.keyboard.finished(&identity);
                log::error!("Playing {} failed: {}", identity, error);
                self.events.push(format!("{} failed: {}", identity, error));
            }
            Outcome::Released { label, count } => {
                self.events.push(format!("release {} ({} voices)", label, count));
            }
        }
    }

    /// Silence everything, wait for in-flight tasks and unregister.
    async fn shutdown(mut self) -> Result<()> {
        let stopped = self.instrument.stop_all();
        log::info!("Stopped {} voices", stopped);

        // Cancelled stop notices resolve whatever is still waiting
        let drain = async { while self.tasks.join_next().await.is_some() {} };
        if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
            log::warn!("Note tasks still running after {:?}, aborting", SHUTDOWN_GRACE);
            self.tasks.abort_all();
            while self.tasks.join_next().await.is_some() {}
        }

        match Arc::try_unwrap(self.instrument) {
            Ok(instrument) => {
                instrument.unregister().await?;
            }
            Err(_) => log::warn!("Instrument still shared at exit, not unregistering"),
        }
        Ok(())
    }
}

async fn run_tui(config: Config) -> Result<()> {
    let mut keyboard_config = config.to_keyboard_config()?;

    let channel = Arc::new(CommandChannel::spawn(config.timing.to_timing_config()));
    let backend: Arc<dyn VoiceBackend> = Arc::new(MidiBackend::from_settings(&config.midi));
    let instrument = Arc::new(Instrument::register(channel, backend).await?);

    // Setup terminal
    enable_raw_mode()?;
    let release_events = supports_keyboard_enhancement().unwrap_or(false);
    let mut stdout = stdout();
    execute!(stdout, EnterAlternateScreen)?;
    if release_events {
        execute!(
            stdout,
            PushKeyboardEnhancementFlags(KeyboardEnhancementFlags::REPORT_EVENT_TYPES)
        )?;
    } else if keyboard_config.note_ms < 0 {
        // Without key-up events held notes would never end
        keyboard_config.note_ms = config.keyboard.auto_release_ms as i64;
        log::info!(
            "Terminal does not report key releases, notes last {}ms",
            keyboard_config.note_ms
        );
    }
    let mut terminal = Terminal::new(CrosstermBackend::new(stdout))?;

    let mut app = App {
        keyboard: VirtualKeyboard::new(keyboard_config),
        instrument,
        events: EventLog::default(),
        tasks: JoinSet::new(),
        release_events,
    };

    let result = run_event_loop(&mut terminal, &mut app, &config.theme).await;

    // Cleanup
    if release_events {
        execute!(terminal.backend_mut(), PopKeyboardEnhancementFlags)?;
    }
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;

    app.shutdown().await?;
    result
}

async fn run_event_loop(
    terminal: &mut Terminal<CrosstermBackend<io::Stdout>>,
    app: &mut App,
    theme: &Theme,
) -> Result<()> {
    let mut input = EventStream::new();

    loop {
        terminal.draw(|frame| {
            let area = frame.area();
            render_status(frame, area, &app.view(), theme)
        })?;

        let step = tokio::select! {
            event = input.next() => Step::Input(event),
            Some(joined) = app.tasks.join_next(), if !app.tasks.is_empty() => Step::Finished(joined),
        };

        match step {
            Step::Input(Some(Ok(Event::Key(key)))) => {
                if app.handle_key(key) {
                    return Ok(());
                }
            }
            Step::Input(Some(Ok(_))) => {}
            Step::Input(Some(Err(e))) => return Err(e.into()),
            Step::Input(None) => return Ok(()),
            Step::Finished(Ok(outcome)) => app.apply(outcome),
            Step::Finished(Err(e)) => log::error!("Note task failed: {}", e),
        }
    }
}
