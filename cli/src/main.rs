use std::path::{Path, PathBuf};
use std::time::Duration;

use assistant_link::net::api::{OutboundRequest, Upload};
use assistant_link::{ApiClient, ApiError, ChannelManager, ClientConfig, ConfigError};
use clap::{Args, Parser, Subcommand};
use protocol::rest::{PreferenceUpdate, TaskCreate, TaskUpdate};
use protocol::{ChatRequest, InboundMessage, ModelSize};
use reqwest::Method;
use reqwest::header::{HeaderName, HeaderValue};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("request failed: {0}")]
    Api(#[from] ApiError),
    #[error("invalid header `{0}` (expected Name:Value)")]
    InvalidHeader(String),
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("failed to read {path}: {source}")]
    ReadFile { path: String, source: std::io::Error },
    #[error("stdin read failed: {0}")]
    Stdin(std::io::Error),
    #[error("chat channel did not open within {0:?}")]
    ConnectTimeout(Duration),
    #[error("timed out waiting for a chat reply")]
    ReplyTimeout,
    #[error("chat channel closed before a reply arrived")]
    ChannelClosed,
    #[error("chat error: {0}")]
    Chat(String),
}

#[derive(Parser, Debug)]
#[command(name = "assistant-cli", about = "Personal assistant REST and chat CLI")]
struct Cli {
    #[arg(long, env = "ASSISTANT_API_URL")]
    api_url: Option<String>,

    #[arg(long, env = "ASSISTANT_WS_URL")]
    ws_url: Option<String>,

    #[arg(long, env = "ASSISTANT_PAGE_ORIGIN", help = "Origin whose hostname the backend shares")]
    page_origin: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Health,
    Api(ApiCommand),
    Tasks(TasksCommand),
    Prefs(PrefsCommand),
    Chat(ChatCommand),
}

#[derive(Args, Debug)]
struct ApiCommand {
    #[command(subcommand)]
    command: ApiSubcommand,
}

#[derive(Subcommand, Debug)]
enum ApiSubcommand {
    Get(RawRequestArgs),
    Post(RawRequestArgs),
    Put(RawRequestArgs),
    Delete(RawRequestArgs),
    Upload {
        endpoint: String,
        file: PathBuf,
        #[arg(long)]
        mime: Option<String>,
    },
}

#[derive(Args, Debug)]
struct RawRequestArgs {
    endpoint: String,

    #[arg(long, help = "JSON request body")]
    data: Option<String>,

    #[arg(long = "header", help = "Extra header as Name:Value (repeatable)")]
    headers: Vec<String>,
}

#[derive(Args, Debug)]
struct TasksCommand {
    #[command(subcommand)]
    command: TasksSubcommand,
}

#[derive(Subcommand, Debug)]
enum TasksSubcommand {
    List,
    Get {
        task_id: String,
    },
    Create {
        title: String,
        #[arg(long)]
        description: Option<String>,
        #[arg(long, default_value_t = false)]
        completed: bool,
    },
    Update {
        task_id: String,
        #[arg(long)]
        title: Option<String>,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        completed: Option<bool>,
    },
    Delete {
        task_id: String,
    },
}

#[derive(Args, Debug)]
struct PrefsCommand {
    #[command(subcommand)]
    command: PrefsSubcommand,
}

#[derive(Subcommand, Debug)]
enum PrefsSubcommand {
    Get,
    Update {
        #[arg(long)]
        communication_style: Option<String>,
        #[arg(long)]
        theme: Option<String>,
        #[arg(long)]
        language: Option<String>,
    },
}

#[derive(Args, Debug)]
struct ChatCommand {
    #[command(subcommand)]
    command: ChatSubcommand,
}

#[derive(Subcommand, Debug)]
enum ChatSubcommand {
    Send {
        message: String,
        #[command(flatten)]
        opts: ChatOpts,
    },
    Repl {
        #[command(flatten)]
        opts: ChatOpts,
    },
}

#[derive(Args, Debug)]
struct ChatOpts {
    #[arg(long)]
    model_size: Option<ModelSize>,

    #[arg(long)]
    conversation_id: Option<String>,

    #[arg(long, default_value_t = 60)]
    timeout_secs: u64,
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();

    let cli = Cli::parse();
    let config = resolve_config(&cli)?;

    match cli.command {
        Command::Health => run_health(&config).await,
        Command::Api(api) => run_api(&config, api).await,
        Command::Tasks(tasks) => run_tasks(&config, tasks).await,
        Command::Prefs(prefs) => run_prefs(&config, prefs).await,
        Command::Chat(chat) => run_chat(&config, chat).await,
    }
}

/// Timeouts and reconnect settings come from the environment; addresses
/// come from the flags, which already fall back to the same variables.
fn resolve_config(cli: &Cli) -> Result<ClientConfig, CliError> {
    let mut config = ClientConfig::from_env()?;
    let addresses =
        ClientConfig::from_parts(cli.api_url.as_deref(), cli.ws_url.as_deref(), cli.page_origin.as_deref())?;
    config.api_base_url = addresses.api_base_url;
    config.ws_base_url = addresses.ws_base_url;
    Ok(config)
}

// =============================================================================
// REST
// =============================================================================

async fn run_health(config: &ClientConfig) -> Result<(), CliError> {
    let api = ApiClient::new(config)?;
    let health = api.health().await?;
    println!("{}", health.status);
    Ok(())
}

async fn run_api(config: &ClientConfig, api_cmd: ApiCommand) -> Result<(), CliError> {
    let api = ApiClient::new(config)?;
    let (method, args) = match api_cmd.command {
        ApiSubcommand::Get(args) => (Method::GET, args),
        ApiSubcommand::Post(args) => (Method::POST, args),
        ApiSubcommand::Put(args) => (Method::PUT, args),
        ApiSubcommand::Delete(args) => (Method::DELETE, args),
        ApiSubcommand::Upload { endpoint, file, mime } => {
            let upload = read_upload(&file, mime).await?;
            let json: Value = api.upload(&endpoint, upload).await?;
            return print_json(&json);
        }
    };

    let request = build_request(method, args)?;
    let json: Value = api.send(request).await?;
    print_json(&json)
}

fn build_request(method: Method, args: RawRequestArgs) -> Result<OutboundRequest, CliError> {
    let mut request = OutboundRequest::new(method, args.endpoint);
    if let Some(data) = args.data {
        let body = serde_json::from_str::<Value>(&data)?;
        request = request.with_json(&body)?;
    }
    for raw in &args.headers {
        let (name, value) = parse_header(raw)?;
        request = request.with_header(name, value);
    }
    Ok(request)
}

fn parse_header(raw: &str) -> Result<(HeaderName, HeaderValue), CliError> {
    let invalid = || CliError::InvalidHeader(raw.to_owned());
    let (name, value) = raw.split_once(':').ok_or_else(invalid)?;
    let name = HeaderName::from_bytes(name.trim().as_bytes()).map_err(|_| invalid())?;
    let value = HeaderValue::from_str(value.trim()).map_err(|_| invalid())?;
    Ok((name, value))
}

async fn read_upload(path: &Path, mime: Option<String>) -> Result<Upload, CliError> {
    let bytes = tokio::fs::read(path).await.map_err(|source| CliError::ReadFile {
        path: path.display().to_string(),
        source,
    })?;
    let file_name = path
        .file_name()
        .map_or_else(|| "upload".to_owned(), |name| name.to_string_lossy().into_owned());
    let upload = Upload::new(file_name, bytes);
    Ok(match mime {
        Some(mime) => upload.with_mime(mime),
        None => upload,
    })
}

async fn run_tasks(config: &ClientConfig, tasks: TasksCommand) -> Result<(), CliError> {
    let api = ApiClient::new(config)?;
    let json = match tasks.command {
        TasksSubcommand::List => serde_json::to_value(api.list_tasks().await?)?,
        TasksSubcommand::Get { task_id } => serde_json::to_value(api.get_task(&task_id).await?)?,
        TasksSubcommand::Create { title, description, completed } => {
            let task = TaskCreate { title, description, completed };
            serde_json::to_value(api.create_task(&task).await?)?
        }
        TasksSubcommand::Update { task_id, title, description, completed } => {
            let update = TaskUpdate { title, description, completed };
            serde_json::to_value(api.update_task(&task_id, &update).await?)?
        }
        TasksSubcommand::Delete { task_id } => serde_json::to_value(api.delete_task(&task_id).await?)?,
    };
    print_json(&json)
}

async fn run_prefs(config: &ClientConfig, prefs: PrefsCommand) -> Result<(), CliError> {
    let api = ApiClient::new(config)?;
    let json = match prefs.command {
        PrefsSubcommand::Get => serde_json::to_value(api.get_preferences().await?)?,
        PrefsSubcommand::Update { communication_style, theme, language } => {
            let update = PreferenceUpdate { communication_style, theme, language };
            serde_json::to_value(api.update_preferences(&update).await?)?
        }
    };
    print_json(&json)
}

// =============================================================================
// CHAT
// =============================================================================

#[derive(Debug)]
enum ChatEvent {
    Message(InboundMessage),
    Error(String),
    Closed,
}

fn subscribe(channel: &ChannelManager) -> mpsc::UnboundedReceiver<ChatEvent> {
    let (tx, rx) = mpsc::unbounded_channel();
    let on_message = tx.clone();
    channel.on_message(move |message| {
        let _ = on_message.send(ChatEvent::Message(message.clone()));
    });
    let on_error = tx.clone();
    channel.on_error(move |message| {
        let _ = on_error.send(ChatEvent::Error(message.to_owned()));
    });
    channel.on_close(move || {
        let _ = tx.send(ChatEvent::Closed);
    });
    rx
}

async fn run_chat(config: &ClientConfig, chat: ChatCommand) -> Result<(), CliError> {
    let channel = ChannelManager::new(config);
    let mut events = subscribe(&channel);
    channel.connect();

    let result = match chat.command {
        ChatSubcommand::Send { message, opts } => chat_send(&channel, &mut events, message, &opts).await,
        ChatSubcommand::Repl { opts } => chat_repl(&channel, &mut events, &opts).await,
    };
    channel.disconnect();
    result
}

async fn chat_send(
    channel: &ChannelManager,
    events: &mut mpsc::UnboundedReceiver<ChatEvent>,
    message: String,
    opts: &ChatOpts,
) -> Result<(), CliError> {
    let timeout = Duration::from_secs(opts.timeout_secs);
    wait_open(channel, events, timeout).await?;
    let reply = exchange(channel, events, build_chat_request(message, opts, None), timeout).await?;
    print_json(&reply.into_frame())
}

async fn chat_repl(
    channel: &ChannelManager,
    events: &mut mpsc::UnboundedReceiver<ChatEvent>,
    opts: &ChatOpts,
) -> Result<(), CliError> {
    let timeout = Duration::from_secs(opts.timeout_secs);
    let mut conversation_id = opts.conversation_id.clone();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    wait_open(channel, events, timeout).await?;
    eprintln!("connected; one message per line, Ctrl-D to quit");

    while let Some(line) = lines.next_line().await.map_err(CliError::Stdin)? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if !channel.is_connected() {
            wait_open(channel, events, timeout).await?;
        }

        let request = build_chat_request(line.to_owned(), opts, conversation_id.as_deref());
        match exchange(channel, events, request, timeout).await {
            Ok(message) => match message.reply() {
                Some(reply) => {
                    conversation_id.get_or_insert_with(|| reply.conversation_id.clone());
                    println!("{}", reply.content);
                }
                None => print_json(message.frame())?,
            },
            Err(err @ (CliError::Chat(_) | CliError::ChannelClosed | CliError::ReplyTimeout)) => {
                eprintln!("error: {err}");
            }
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

fn build_chat_request(message: String, opts: &ChatOpts, conversation_id: Option<&str>) -> ChatRequest {
    let mut request = ChatRequest::new(message);
    if let Some(size) = opts.model_size {
        request = request.with_model_size(size);
    }
    if let Some(id) = conversation_id.or(opts.conversation_id.as_deref()) {
        request = request.with_conversation_id(id);
    }
    request
}

/// Wait until the channel is open. Connection errors while waiting are
/// logged; the channel keeps retrying on its own schedule.
async fn wait_open(
    channel: &ChannelManager,
    events: &mut mpsc::UnboundedReceiver<ChatEvent>,
    timeout: Duration,
) -> Result<(), CliError> {
    let wait = async {
        while !channel.is_connected() {
            tokio::select! {
                Some(event) = events.recv() => {
                    tracing::debug!(?event, "chat event while connecting");
                }
                () = tokio::time::sleep(Duration::from_millis(25)) => {}
            }
        }
    };
    tokio::time::timeout(timeout, wait)
        .await
        .map_err(|_| CliError::ConnectTimeout(timeout))
}

async fn exchange(
    channel: &ChannelManager,
    events: &mut mpsc::UnboundedReceiver<ChatEvent>,
    request: ChatRequest,
    timeout: Duration,
) -> Result<InboundMessage, CliError> {
    if !channel.send_message(&request) {
        // The error listener already queued the reason.
        return match events.try_recv() {
            Ok(ChatEvent::Error(message)) => Err(CliError::Chat(message)),
            _ => Err(CliError::ChannelClosed),
        };
    }

    let next = tokio::time::timeout(timeout, events.recv())
        .await
        .map_err(|_| CliError::ReplyTimeout)?;
    match next {
        Some(ChatEvent::Message(message)) => Ok(message),
        Some(ChatEvent::Error(message)) => Err(CliError::Chat(message)),
        Some(ChatEvent::Closed) | None => Err(CliError::ChannelClosed),
    }
}

fn print_json(value: &Value) -> Result<(), CliError> {
    let rendered = serde_json::to_string_pretty(value)?;
    println!("{rendered}");
    Ok(())
}

#[cfg(test)]
#[path = "main_test.rs"]
mod tests;
