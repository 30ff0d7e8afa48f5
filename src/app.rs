//! Terminal host
//!
//! Runs voice and text interviews, persists every transcript as it grows,
//! and manages saved sessions and settings.

use std::io::Write;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};

use crate::chat::{backend_for, ChatSession};
use crate::cli::{Cli, Command, ConfigCommand, ConfigSetArgs, InterviewArgs, SessionsCommand};
use crate::credentials;
use crate::instruction::{text_instruction, voice_instruction};
use crate::settings::{self, ApiConfig, AppSettings, InterviewMode, InterviewSettings, Provider};
use crate::store::{SavedSession, SessionStore};
use crate::transcript::{export_file_name, Message, Role, Transcript};
use crate::voice::{CallPhase, VoiceDevices, VoiceEvent, VoiceSessionHandle, VoiceStatus};

const METER_CELLS: usize = 12;

type InputLines = Lines<BufReader<Stdin>>;

fn input_lines() -> InputLines {
    BufReader::new(tokio::io::stdin()).lines()
}

pub async fn run(cli: Cli) -> Result<()> {
    let store = SessionStore::default();

    match cli.command {
        Command::Interview(args) => interview(args, &store).await,
        Command::Resume { id, api_key } => resume(&id, api_key.as_deref(), &store).await,
        Command::Sessions { command } => sessions(command, &store),
        Command::Config { command } => config(command),
    }
}

async fn interview(args: InterviewArgs, store: &SessionStore) -> Result<()> {
    let interview = args.settings();
    if interview.role.is_empty() {
        bail!("--role must not be empty");
    }
    let settings = settings::load_settings();

    match interview.mode {
        InterviewMode::Voice => {
            voice_interview(&settings, interview, args.api_key.as_deref(), store).await
        }
        InterviewMode::Text => {
            let saved = SavedSession::new(interview);
            text_interview(&settings, saved, args.api_key.as_deref(), store).await
        }
    }
}

async fn resume(id: &str, api_key: Option<&str>, store: &SessionStore) -> Result<()> {
    let saved = store
        .get(id)
        .with_context(|| format!("Could not open session {}", id))?;
    if saved.settings.mode == InterviewMode::Voice {
        println!("Voice sessions continue as a text chat.");
    }
    let settings = settings::load_settings();
    text_interview(&settings, saved, api_key, store).await
}

/// Persist the latest transcript; failures are reported but not fatal
fn persist(store: &SessionStore, saved: &mut SavedSession) {
    match store.save(saved) {
        Ok(stored) => *saved = stored,
        Err(e) => eprintln!("Warning: could not save session: {}", e),
    }
}

// ----- Voice -----

fn meter_bar(volume: f32) -> String {
    let filled = ((volume.clamp(0.0, 100.0) / 100.0) * METER_CELLS as f32).round() as usize;
    format!(
        "{}{}",
        "#".repeat(filled),
        "-".repeat(METER_CELLS - filled)
    )
}

fn status_line(status: &VoiceStatus) -> String {
    let phase = match status.phase {
        CallPhase::Idle => "idle",
        CallPhase::Connecting => "connecting",
        CallPhase::Live => "live",
    };
    let speaker = if status.ai_speaking {
        "interviewer is speaking"
    } else {
        "listening"
    };
    format!("[{}] mic [{}] {}", phase, meter_bar(status.volume), speaker)
}

fn redraw_status(status: &VoiceStatus) {
    print!("\r\x1b[2K{}", status_line(status));
    let _ = std::io::stdout().flush();
}

fn print_above_status(text: &str) {
    println!("\r\x1b[2K{}", text);
}

async fn voice_interview(
    settings: &AppSettings,
    interview: InterviewSettings,
    flag_key: Option<&str>,
    store: &SessionStore,
) -> Result<()> {
    // Voice always runs on Gemini, whatever the text provider is
    let mut gemini = ApiConfig::for_provider(Provider::Gemini);
    if !gemini.resolve_api_key(flag_key) {
        bail!("A Gemini API key is required for voice interviews (--api-key, keyring or GEMINI_API_KEY)");
    }

    let config = settings.voice_session_config(gemini.api_key, voice_instruction(&interview));
    let (handle, mut events) = VoiceSessionHandle::spawn(config, VoiceDevices::system());
    let mut status_rx = handle.subscribe();
    let mut saved = SavedSession::new(interview);

    println!("Connecting to SteadyCoach... (Ctrl-C to cancel)");
    let connected = tokio::select! {
        result = handle.connect() => result,
        _ = tokio::signal::ctrl_c() => {
            handle.disconnect().await;
            handle.shutdown().await;
            println!("Cancelled.");
            return Ok(());
        }
    };
    if let Err(e) = connected {
        handle.shutdown().await;
        bail!("Could not start the voice call: {}", e);
    }

    println!("Connected. Speak naturally; press Enter to end the call.");
    let mut input = input_lines();
    let mut ended = false;

    while !ended {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => ended = handle_voice_event(event, store, &mut saved),
                None => ended = true,
            },
            changed = status_rx.changed() => {
                if changed.is_err() {
                    ended = true;
                } else {
                    let status = *status_rx.borrow_and_update();
                    redraw_status(&status);
                }
            }
            _ = input.next_line() => break,
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    handle.disconnect().await;
    handle.shutdown().await;
    // Turns flushed by teardown, then the final statistics
    while let Ok(event) = events.try_recv() {
        handle_voice_event(event, store, &mut saved);
    }

    println!();
    if !saved.messages.is_empty() {
        println!("Session saved as {}", saved.id);
    }
    Ok(())
}

/// Returns true once the call has ended
fn handle_voice_event(event: VoiceEvent, store: &SessionStore, saved: &mut SavedSession) -> bool {
    match event {
        VoiceEvent::Transcript { role, text } => {
            print_above_status(&format!("{}: {}", role.label(), text));
            saved.messages.push(Message::new(role, text));
            persist(store, saved);
            false
        }
        VoiceEvent::Error(e) => {
            print_above_status(&format!("Call error: {}", e));
            false
        }
        VoiceEvent::Closed { reason } => {
            print_above_status(&format!("Call closed by the server: {}", reason));
            false
        }
        VoiceEvent::Ended(stats) => {
            print_above_status("Call ended.");
            log::info!("Voice call stats: {}", stats.summary());
            true
        }
    }
}

// ----- Text -----

/// Prints only the part of each snapshot not yet on screen
struct StreamPrinter {
    printed: usize,
}

impl StreamPrinter {
    fn new() -> Self {
        print!("\n{}: ", Role::Assistant.label());
        let _ = std::io::stdout().flush();
        Self { printed: 0 }
    }

    fn update(&mut self, snapshot: &str) {
        if let Some(fresh) = snapshot.get(self.printed..) {
            print!("{}", fresh);
            let _ = std::io::stdout().flush();
        }
        self.printed = snapshot.len();
    }
}

/// Sources list shown under a grounded reply
fn sources_block(message: &Message) -> Option<String> {
    let sources = message.sources();
    if sources.is_empty() {
        return None;
    }
    let mut block = String::from("Sources:");
    for source in sources {
        block.push_str(&format!("\n  - {}\n    {}", source.title, source.uri));
    }
    Some(block)
}

fn print_sources(message: &Message) {
    if let Some(block) = sources_block(message) {
        println!("\n{}", block);
    }
}

async fn text_interview(
    settings: &AppSettings,
    mut saved: SavedSession,
    flag_key: Option<&str>,
    store: &SessionStore,
) -> Result<()> {
    let mut api = settings.api.clone();
    api.resolve_api_key(flag_key);
    let backend = backend_for(&api).context("Text chat is not configured")?;

    // Voice transcripts carry no system message
    let mut messages = saved.messages.clone();
    if !messages.is_empty() && !messages.iter().any(|m| m.role == Role::System) {
        messages.insert(0, Message::system(text_instruction(&saved.settings)));
    }
    let mut chat = ChatSession::resume(
        backend,
        api.enable_contextual_grounding,
        Transcript::from_messages(messages),
    );

    println!(
        "Interview for {} ({}). Commands: /restart, /export, /quit",
        saved.title(),
        api.provider.display_name()
    );

    if chat.transcript().is_empty() {
        open_chat(&mut chat, &saved.settings).await;
    } else {
        for message in chat.transcript().dialogue() {
            println!("\n{}: {}", message.role.label(), message.content);
            print_sources(message);
        }
    }
    saved.messages = chat.messages().to_vec();
    persist(store, &mut saved);

    let mut input = input_lines();
    loop {
        print!("\n> ");
        let _ = std::io::stdout().flush();

        let line = tokio::select! {
            line = input.next_line() => line.context("Failed to read input")?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else { break };

        match line.trim() {
            "/quit" | "/exit" => break,
            "/restart" => {
                chat.reset();
                saved = SavedSession::new(saved.settings.clone());
                println!("Session restarted.");
                open_chat(&mut chat, &saved.settings).await;
            }
            "/export" => {
                let path = PathBuf::from(export_file_name(chrono::Local::now().date_naive()));
                std::fs::write(&path, chat.transcript().export_text())
                    .with_context(|| format!("Failed to write {:?}", path))?;
                println!("Transcript written to {}", path.display());
                continue;
            }
            content => {
                let mut printer = StreamPrinter::new();
                let result = chat.send(content, &mut |s| printer.update(s)).await;
                println!();
                match result {
                    Ok(Some(reply)) => print_sources(reply),
                    Ok(None) => {}
                    Err(e) => eprintln!("Error: {}", e),
                }
            }
        }

        saved.messages = chat.messages().to_vec();
        if !saved.messages.is_empty() {
            persist(store, &mut saved);
        }
    }

    println!("Session saved as {}", saved.id);
    Ok(())
}

async fn open_chat(chat: &mut ChatSession, interview: &InterviewSettings) {
    let mut printer = StreamPrinter::new();
    let result = chat.start(interview, &mut |s| printer.update(s)).await;
    println!();
    match result {
        Ok(Some(reply)) => print_sources(reply),
        Ok(None) => {}
        Err(e) => eprintln!("Error: {}", e),
    }
}

// ----- Sessions -----

fn sessions(command: SessionsCommand, store: &SessionStore) -> Result<()> {
    match command {
        SessionsCommand::List => {
            let sessions = store.list();
            if sessions.is_empty() {
                println!("No saved sessions.");
            }
            for s in sessions {
                let updated = s
                    .updated_at()
                    .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_default();
                println!(
                    "{}  {}  {:?}  {} messages  {}",
                    s.id,
                    updated,
                    s.settings.mode,
                    s.messages.iter().filter(|m| m.role != Role::System).count(),
                    s.title()
                );
            }
        }
        SessionsCommand::Show { id } => {
            let s = store.get(&id)?;
            println!("{}\n", s.title());
            println!("{}", s.transcript().export_text());
        }
        SessionsCommand::Export { id, output } => {
            let s = store.get(&id)?;
            let path = output.unwrap_or_else(|| {
                PathBuf::from(export_file_name(chrono::Local::now().date_naive()))
            });
            std::fs::write(&path, s.transcript().export_text())
                .with_context(|| format!("Failed to write {:?}", path))?;
            println!("Transcript written to {}", path.display());
        }
        SessionsCommand::Delete { id } => {
            let remaining = store.delete(&id)?;
            println!("Deleted. {} sessions left.", remaining.len());
        }
        SessionsCommand::Clear { yes } => {
            if !yes {
                bail!("This deletes every saved session; pass --yes to confirm");
            }
            store.clear()?;
            println!("All sessions deleted.");
        }
    }
    Ok(())
}

// ----- Config -----

fn config(command: ConfigCommand) -> Result<()> {
    let mut settings = settings::load_settings();

    match command {
        ConfigCommand::Show => {
            let api = &settings.api;
            let key_status = match credentials::get_api_key(api.provider) {
                Some(key) => format!("keyring ({})", credentials::mask_key(&key)),
                None => {
                    let mut probe = api.clone();
                    if probe.resolve_api_key(None) {
                        format!("environment ({})", credentials::mask_key(&probe.api_key))
                    } else {
                        "not set".to_string()
                    }
                }
            };
            println!("Settings file: {}", settings::settings_path().display());
            println!("Provider:      {} ({})", api.provider.display_name(), api.provider);
            println!("Model:         {}", api.model);
            if !api.base_url.is_empty() {
                println!("Base URL:      {}", api.base_url);
            }
            println!("Grounding:     {}", api.enable_contextual_grounding);
            println!("API key:       {}", key_status);
            println!(
                "Voice:         {} / {}",
                settings.voice_model.as_deref().unwrap_or(crate::live::DEFAULT_LIVE_MODEL),
                settings.voice_name.as_deref().unwrap_or(crate::live::DEFAULT_VOICE_NAME)
            );
        }
        ConfigCommand::Set(args) => {
            apply_config(&mut settings, &args);
            if let Some(key) = args.api_key.as_deref() {
                credentials::set_api_key(settings.api.provider, Some(key))
                    .context("Failed to store the API key in the keyring")?;
            }
            settings::save_settings(&settings)?;
            println!("Settings saved.");
        }
    }
    Ok(())
}

fn apply_config(settings: &mut AppSettings, args: &ConfigSetArgs) {
    if let Some(provider) = args.provider {
        if provider != settings.api.provider {
            settings.api.switch_provider(provider);
        }
    }
    if let Some(model) = &args.model {
        settings.api.model = model.clone();
    }
    if let Some(base_url) = &args.base_url {
        settings.api.base_url = base_url.clone();
    }
    if let Some(grounding) = args.grounding {
        settings.api.enable_contextual_grounding = grounding;
    }
    if let Some(voice_model) = &args.voice_model {
        settings.voice_model = Some(voice_model.clone()).filter(|v| !v.is_empty());
    }
    if let Some(voice_name) = &args.voice_name {
        settings.voice_name = Some(voice_name.clone()).filter(|v| !v.is_empty());
    }
}
