use std::net::{IpAddr, SocketAddr};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use teloxide::prelude::*;
use teloxide::types::FileId;
use teloxide::update_listeners::webhooks;
use teloxide::utils::command::BotCommands;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;

use poe_telegram::chatbot::commands::{self, CallbackAction, Command, GENERIC_ERROR_REPLY, UNAUTHORIZED_REPLY};
use poe_telegram::chatbot::gateway::{apology, GatewayError};
use poe_telegram::chatbot::{CompletionGateway, Database, TelegramClient, UserInput};
use poe_telegram::config::Config;
use poe_telegram::poe::PoeClient;
use poe_telegram::telegram_log::TelegramLogLayer;

/// Telegram front end for Poe bots.
#[derive(Parser)]
#[command(name = "poe-telegram", version)]
struct Cli {
    /// Use long polling instead of a webhook
    #[arg(long)]
    poll: bool,

    /// Address the webhook server listens on
    #[arg(long, default_value = "0.0.0.0")]
    host: IpAddr,

    /// Port the webhook server listens on
    #[arg(long, default_value_t = 8000)]
    port: u16,
}

struct BotState {
    config: Config,
    db: Database,
    gateway: CompletionGateway,
    telegram: TelegramClient,
}

impl BotState {
    fn new(config: Config, db: Database, bot: &Bot) -> Self {
        if config.poe_api_key.is_empty() {
            warn!("POE_API_KEY is not set; every request will fail until it is configured");
        }

        let poe = PoeClient::with_base_urls(
            config.poe_api_key.clone(),
            config.poe_api_url.clone(),
            config.poe_upload_url.clone(),
        );
        let gateway = CompletionGateway::new(Arc::new(poe), config.history_limit);
        let telegram = TelegramClient::new(bot.clone(), config.message_limit, config.chunk_delay);

        Self { config, db, gateway, telegram }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    dotenvy::dotenv().ok();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    let bot = Bot::new(&config.telegram_token);
    let _guard = init_logging(&config, &bot);

    info!("🚀 Starting poe-telegram...");
    info!("Default model: {} ({} selectable)", config.default_bot, config.available_bots.len());
    if config.authorization {
        info!("Authorization enabled for {} user(s)", config.authorized_users.len());
    }

    let webhook_url = if cli.poll {
        None
    } else {
        let Some(endpoint) = config.webhook_endpoint() else {
            error!("WEBHOOK_URL is not set. Set it or run with --poll");
            return ExitCode::FAILURE;
        };
        match endpoint.parse::<reqwest::Url>() {
            Ok(url) => Some(url),
            Err(e) => {
                error!("Invalid WEBHOOK_URL {endpoint}: {e}");
                return ExitCode::FAILURE;
            }
        }
    };

    let db = match Database::open(&config.database_url, config.default_bot.clone()) {
        Ok(db) => db,
        Err(e) => {
            error!("Failed to open database {}: {e}", config.database_url);
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = bot.set_my_commands(Command::bot_commands()).await {
        warn!("Failed to register bot commands: {e}");
    }

    let state = Arc::new(BotState::new(config, db, &bot));

    let handler = dptree::entry()
        .branch(
            Update::filter_message()
                .branch(dptree::entry().filter_command::<Command>().endpoint(handle_command))
                .branch(
                    dptree::filter(|msg: Message| msg.photo().is_some() || msg.document().is_some())
                        .endpoint(handle_media),
                )
                .branch(dptree::endpoint(handle_text)),
        )
        .branch(Update::filter_callback_query().endpoint(handle_callback));

    let mut dispatcher = Dispatcher::builder(bot.clone(), handler)
        .dependencies(dptree::deps![state])
        .enable_ctrlc_handler()
        .build();

    match webhook_url {
        None => {
            info!("Starting bot in polling mode...");
            if let Err(e) = bot.delete_webhook().await {
                warn!("Failed to delete webhook: {e}");
            }
            dispatcher.dispatch().await;
        }
        Some(url) => {
            let addr = SocketAddr::new(cli.host, cli.port);
            info!("Starting bot in webhook mode on {addr} ({url})");
            let listener = match webhooks::axum(bot, webhooks::Options::new(addr, url)).await {
                Ok(listener) => listener,
                Err(e) => {
                    error!("Failed to set up webhook: {e}");
                    return ExitCode::FAILURE;
                }
            };
            dispatcher
                .dispatch_with_listener(listener, LoggingErrorHandler::with_custom_text("An error from the update listener"))
                .await;
        }
    }

    ExitCode::SUCCESS
}

/// Stdout, log file and (optionally) the admin chat. The returned guard must
/// live as long as the process so the file writer flushes.
fn init_logging(config: &Config, bot: &Bot) -> Option<WorkerGuard> {
    let env_filter = || tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into());

    let log_file = std::fs::create_dir_all(&config.log_dir)
        .and_then(|_| {
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(config.log_dir.join("poe-telegram.log"))
        })
        .map_err(|e| eprintln!("Logging to stdout only, cannot open log file in {:?}: {e}", config.log_dir))
        .ok();

    let (file_layer, guard) = match log_file {
        Some(file) => {
            let (non_blocking, guard) = tracing_appender::non_blocking(file);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_filter(env_filter());
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let tg_layer = config
        .log_chat_id
        .map(|chat_id| TelegramLogLayer::new(bot.clone(), chat_id));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stdout)
                .with_filter(env_filter()),
        )
        .with(file_layer)
        .with(tg_layer)
        .init();

    guard
}

async fn handle_command(msg: Message, cmd: Command, state: Arc<BotState>) -> ResponseResult<()> {
    let Some(user) = msg.from.as_ref() else {
        return Ok(());
    };
    let user_id = user.id.0 as i64;
    info!("⌨️ {:?} from user {}", cmd, user_id);

    let reply = commands::execute(&state.db, &state.config, user_id, user.username.as_deref(), cmd)
        .unwrap_or_else(|e| {
            error!("Command failed for user {user_id}: {e}");
            commands::Reply::text(GENERIC_ERROR_REPLY)
        });

    state.telegram.send_reply(msg.chat.id, reply).await.ok();
    Ok(())
}

async fn handle_callback(q: CallbackQuery, state: Arc<BotState>) -> ResponseResult<()> {
    state.telegram.answer_callback(&q).await;

    let Some(action) = q.data.as_deref().and_then(CallbackAction::parse) else {
        return Ok(());
    };
    let user_id = q.from.id.0 as i64;
    info!("🔘 {:?} from user {}", action, user_id);

    let text = commands::handle_callback(&state.db, user_id, action).unwrap_or_else(|e| {
        error!("Callback failed for user {user_id}: {e}");
        GENERIC_ERROR_REPLY.to_string()
    });

    if let Some(message) = q.regular_message() {
        state.telegram.edit_message(message.chat.id, message.id, &text).await.ok();
    }
    Ok(())
}

async fn handle_text(msg: Message, state: Arc<BotState>) -> ResponseResult<()> {
    let Some(user) = msg.from.as_ref() else {
        return Ok(());
    };
    let Some(text) = msg.text() else {
        return Ok(());
    };
    // Unknown commands are not forwarded
    if text.starts_with('/') {
        return Ok(());
    }

    let user_id = user.id.0 as i64;
    if !state.config.is_authorized(user.username.as_deref()) {
        info!("Rejected message from unauthorized user {user_id}");
        state.telegram.send_reply(msg.chat.id, commands::Reply::text(UNAUTHORIZED_REPLY)).await.ok();
        return Ok(());
    }

    if let Some(reply) = commands::session_reply(&state.db, user_id, text) {
        state.telegram.send_reply(msg.chat.id, reply).await.ok();
        return Ok(());
    }

    let preview: String = text.chars().take(100).collect();
    info!("📨 Message from user {user_id}: \"{preview}\"");

    relay(&state, msg.chat.id, user_id, UserInput::text(text)).await;
    Ok(())
}

async fn handle_media(msg: Message, state: Arc<BotState>) -> ResponseResult<()> {
    let Some(user) = msg.from.as_ref() else {
        return Ok(());
    };
    let user_id = user.id.0 as i64;
    if !state.config.is_authorized(user.username.as_deref()) {
        info!("Rejected media from unauthorized user {user_id}");
        state.telegram.send_reply(msg.chat.id, commands::Reply::text(UNAUTHORIZED_REPLY)).await.ok();
        return Ok(());
    }

    let caption = msg.caption().unwrap_or_default();
    if caption.trim().is_empty() {
        state.telegram.send_long(msg.chat.id, &apology(&GatewayError::MissingText)).await.ok();
        return Ok(());
    }

    let Some((file_id, name)) = attached_file(&msg) else {
        return Ok(());
    };
    info!("📎 File from user {user_id}: {:?}", name);

    let file = match state.telegram.remote_file(file_id, name).await {
        Ok(file) => file,
        Err(e) => {
            error!("{e}");
            state
                .telegram
                .send_long(msg.chat.id, &format!("Sorry, I encountered an error: {e}"))
                .await
                .ok();
            return Ok(());
        }
    };

    let input = UserInput { text: caption.to_string(), files: vec![file] };
    relay(&state, msg.chat.id, user_id, input).await;
    Ok(())
}

/// The largest photo size or the document, with its original name if known.
fn attached_file(msg: &Message) -> Option<(FileId, Option<String>)> {
    if let Some(photo) = msg.photo().and_then(|sizes| sizes.last()) {
        return Some((photo.file.id.clone(), None));
    }
    msg.document()
        .map(|doc| (doc.file.id.clone(), doc.file_name.clone()))
}

/// Query the bot and send the answer, keeping the typing indicator alive
/// while the response streams in.
async fn relay(state: &BotState, chat_id: ChatId, user_id: i64, input: UserInput) {
    let respond = state.gateway.respond(&state.db, user_id, input);
    tokio::pin!(respond);

    let mut typing = tokio::time::interval(Duration::from_secs(4));
    let response = loop {
        tokio::select! {
            response = &mut respond => break response,
            _ = typing.tick() => state.telegram.send_typing(chat_id).await,
        }
    };

    state.telegram.send_long(chat_id, &response).await.ok();
}
