use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use snafu::{ResultExt, Snafu};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;

use crate::app::Storefront;
use crate::catalog::Assistant;
use crate::chat::{ChatThread, ChunkCallback, StreamState, ThreadRepository};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ConsoleError {
    #[snafu(display("failed to read console input on `{stage}`: {source}"))]
    ReadInput {
        stage: &'static str,
        source: std::io::Error,
    },
}

/// One line of console input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Send(String),
    New(Option<String>),
    Threads,
    Switch(usize),
    Stop,
    Prompts,
    Assistants,
    Models,
    Key(String),
    Help,
    Quit,
    Unknown(String),
    Empty,
}

impl Command {
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        if line.is_empty() {
            return Self::Empty;
        }
        let Some(command) = line.strip_prefix('/') else {
            return Self::Send(line.to_string());
        };

        let (name, argument) = match command.split_once(char::is_whitespace) {
            Some((name, argument)) => (name, argument.trim()),
            None => (command, ""),
        };
        let argument = (!argument.is_empty()).then(|| argument.to_string());

        match (name, argument) {
            ("new", argument) => Self::New(argument),
            ("threads", _) => Self::Threads,
            ("switch", Some(index)) => match index.parse::<usize>() {
                Ok(index) if index > 0 => Self::Switch(index),
                _ => Self::Unknown(line.to_string()),
            },
            ("stop", _) => Self::Stop,
            ("prompts", _) => Self::Prompts,
            ("assistants", _) => Self::Assistants,
            ("models", _) => Self::Models,
            ("key", argument) => Self::Key(argument.unwrap_or_default()),
            ("help", _) => Self::Help,
            ("quit" | "exit", _) => Self::Quit,
            _ => Self::Unknown(line.to_string()),
        }
    }
}

const HELP: &str = "\
commands:
  <text>               send to the current thread
  /new [assistant]     start a thread (default assistant if omitted)
  /threads             list threads, newest first
  /switch <n>          make thread n from /threads current
  /stop                stop every streaming reply
  /prompts             list prompt templates
  /assistants          list assistants
  /models              list models
  /key <api key>       set the API key (blank clears it)
  /quit                leave";

/// Reads commands from stdin until `/quit` or end of input.
pub async fn run(storefront: Storefront) -> Result<(), ConsoleError> {
    let storefront = Arc::new(storefront);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut in_flight: Option<JoinHandle<()>> = None;

    println!("storefront console; /help lists commands");
    while let Some(line) = lines.next_line().await.context(ReadInputSnafu {
        stage: "read-console-line",
    })? {
        match Command::parse(&line) {
            Command::Empty => {}
            Command::Send(text) => {
                if let Some(previous) = in_flight.take() {
                    let _ = previous.await;
                }
                in_flight = Some(spawn_send(&storefront, text));
            }
            Command::New(assistant) => {
                let assistant = assistant.unwrap_or_else(|| storefront.settings().default_assistant.clone());
                let (id, name) = resolve_assistant(&storefront, &assistant);
                let thread_id = storefront.threads().create_thread(id, name.clone());
                println!("new thread {thread_id} with {name}");
            }
            Command::Threads => print_threads(&storefront.threads().get_all_threads(), storefront.threads()),
            Command::Switch(index) => {
                let threads = storefront.threads().get_all_threads();
                match threads.get(index - 1) {
                    Some(thread) if storefront.threads().set_current_thread(thread.id) => {
                        println!("switched to {}", thread.title());
                    }
                    _ => println!("no thread {index}"),
                }
            }
            Command::Stop => {
                let stopped = storefront.threads().stop_streaming();
                println!("\nstopped {stopped} stream(s)");
            }
            Command::Prompts => match storefront.prompts().list(false).await {
                Ok(catalog) => {
                    if let Some(warning) = &catalog.warning {
                        println!("({warning})");
                    }
                    for prompt in &catalog.items {
                        println!("- {} [{}]", prompt.title, prompt.id);
                    }
                }
                Err(error) => println!("prompts unavailable: {error}"),
            },
            Command::Assistants => match storefront.assistants().list(false).await {
                Ok(catalog) => {
                    if let Some(warning) = &catalog.warning {
                        println!("({warning})");
                    }
                    for assistant in &catalog.items {
                        print_assistant(assistant);
                    }
                }
                Err(error) => println!("assistants unavailable: {error}"),
            },
            Command::Models => match storefront.models().list(false).await {
                Ok(catalog) => {
                    if let Some(warning) = &catalog.warning {
                        println!("({warning})");
                    }
                    for model in &catalog.items {
                        match model.summary() {
                            Some(summary) => println!("- {} ({summary})", model.id),
                            None => println!("- {}", model.id),
                        }
                    }
                }
                Err(error) => println!("models unavailable: {error}"),
            },
            Command::Key(key) => match storefront.set_api_key(&key) {
                Ok(remote) => {
                    println!("remote assistants {}", if remote { "enabled" } else { "disabled" });
                }
                Err(error) => println!("API key not changed: {error}"),
            },
            Command::Help => println!("{HELP}"),
            Command::Quit => break,
            Command::Unknown(line) => println!("unknown command: {line}"),
        }
    }

    storefront.threads().stop_streaming();
    if let Some(previous) = in_flight.take() {
        let _ = previous.await;
    }
    Ok(())
}

fn resolve_assistant(storefront: &Storefront, assistant: &str) -> (String, String) {
    match storefront.assistants().find(assistant) {
        Some(Assistant { id, name, .. }) => (id, name),
        None => (assistant.to_string(), assistant.to_string()),
    }
}

fn spawn_send(storefront: &Arc<Storefront>, text: String) -> JoinHandle<()> {
    let storefront = storefront.clone();
    tokio::spawn(async move {
        let threads = storefront.threads();
        if threads.current_thread_id().is_none() {
            let assistant = storefront.settings().default_assistant.clone();
            let (id, name) = resolve_assistant(&storefront, &assistant);
            threads.create_thread(id, name);
        }

        match threads.send_message_with_streaming(&text, Some(printing_callback()), None).await {
            Ok(_) => println!(),
            Err(error) => println!("\n[error] {error}"),
        }
    })
}

// Prefixes arrive whole; print only what is new since the last one.
fn printing_callback() -> ChunkCallback {
    let printed = AtomicUsize::new(0);
    Arc::new(move |prefix: &str| {
        let start = printed.swap(prefix.len(), Ordering::SeqCst);
        let mut stdout = std::io::stdout().lock();
        let _ = write!(stdout, "{}", prefix.get(start..).unwrap_or_default());
        let _ = stdout.flush();
    })
}

fn print_threads(threads: &[ChatThread], repository: &ThreadRepository) {
    if threads.is_empty() {
        println!("no threads yet");
        return;
    }
    let current = repository.current_thread_id();
    for (index, thread) in threads.iter().enumerate() {
        let marker = if Some(thread.id) == current { '*' } else { ' ' };
        let pin = if thread.is_pinned { " (pinned)" } else { "" };
        let badge = stream_badge(&repository.stream_state(thread.id));
        println!(
            "{marker} {}. {}{pin}{badge}  [{} messages, {}]",
            index + 1,
            thread.title(),
            thread.messages.len(),
            thread.updated_at.format("%Y-%m-%d %H:%M"),
        );
    }
}

// Completed replies need no marker; the message itself shows the outcome.
fn stream_badge(state: &StreamState) -> &'static str {
    match state {
        StreamState::Idle | StreamState::Completed(_) => "",
        StreamState::Streaming(_) => " …",
        StreamState::Cancelled(_) => " (stopped)",
        StreamState::Failed { .. } => " (failed)",
    }
}

fn print_assistant(assistant: &Assistant) {
    let kind = if assistant.kind.is_remote() { "remote" } else { "built-in" };
    match &assistant.description {
        Some(description) => println!("- {} ({kind}): {description}", assistant.name),
        None => println!("- {} ({kind})", assistant.name),
    }
}
