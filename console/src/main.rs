use clap::Parser;
use console::channel::UdpTransport;
use console::context::TelemetryContext;
use console::dispatch::{apply_completion, CommandDispatcher};
use console::health::Connectivity;
use console::window::{ConsoleFilter, ConsoleWindow};
use log::info;
use shared::{LogLevel, RequestAction, ResourceId, ResponseBody};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Feed address to connect to
    #[arg(short = 'f', long, default_value = "127.0.0.1:8080")]
    feed: String,

    /// Resource to watch
    #[arg(short = 'r', long, default_value = "srv-1")]
    resource: String,

    /// Minimum console level to show (debug, info, warn, error)
    #[arg(short = 'l', long, default_value = "debug")]
    min_level: String,

    /// Terminal rows the console view occupies
    #[arg(long, default_value = "40")]
    rows: usize,
}

const ROW_HEIGHT_PX: f32 = 16.0;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();
    let resource = ResourceId::new(args.resource.clone());
    let min_level = LogLevel::parse_loose(&args.min_level)
        .ok_or_else(|| format!("unknown level '{}'", args.min_level))?;

    info!("Connecting to feed at {}", args.feed);
    info!("Watching {}", resource);
    info!("Type a command to send it; /start /stop /restart /eula /backlog /state /clear control the view and process");

    let transport = Arc::new(UdpTransport::connect(&args.feed).await?);
    let client = Arc::new(transport.request_client());
    let (completions_tx, mut completions_rx) = mpsc::unbounded_channel();
    let dispatcher = CommandDispatcher::new(client, completions_tx);

    let (mut ctx, mut events_rx) = TelemetryContext::new(transport);
    ctx.select(&resource);

    let mut window = ConsoleWindow::with_fixed_height(ROW_HEIGHT_PX);
    window.set_viewport(args.rows as f32 * ROW_HEIGHT_PX);
    window.set_filter(ConsoleFilter {
        min_level,
        query: None,
    });

    // Pull the pre-subscription scrollback and current process state
    // once at startup
    dispatcher.dispatch(&mut ctx.store, &resource, RequestAction::ConsoleBacklog);
    dispatcher.dispatch(&mut ctx.store, &resource, RequestAction::StateSnapshot);

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut render_timer = tokio::time::interval(Duration::from_millis(100));
    // The EULA gate has no dedicated topic; poll it until accepted
    let mut eula_poll = tokio::time::interval(Duration::from_secs(2));
    let mut eula_accepted = false;
    let mut last_printed_seq: Option<u64> = None;
    let mut last_shown = Connectivity::Disconnected;

    loop {
        tokio::select! {
            Some(event) = events_rx.recv() => {
                ctx.apply_event(event, Instant::now());
            }
            Some(completion) = completions_rx.recv() => {
                if let Ok(ResponseBody::Eula { accepted }) = &completion.result {
                    eula_accepted = *accepted;
                }
                apply_completion(&mut ctx.store, completion);
            }
            _ = eula_poll.tick(), if !eula_accepted => {
                dispatcher.dispatch(&mut ctx.store, &resource, RequestAction::EulaStatus);
            }
            line = stdin.next_line() => {
                match line? {
                    Some(line) => {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        handle_input(&dispatcher, &mut ctx, &resource, line);
                    }
                    None => break,
                }
            }
            _ = render_timer.tick() => {
                let now = Instant::now();
                ctx.tick(now);

                let connectivity = ctx.connectivity(&resource);
                if connectivity != last_shown {
                    println!("--- {} is {:?} ---", resource, connectivity);
                    last_shown = connectivity;
                }

                let snapshot = ctx.store.entry(&resource).console.snapshot();
                for row in window.visible_rows(&snapshot) {
                    if last_printed_seq.map_or(true, |last| row.seq > last) {
                        println!("[{}] {}", row.record.level, row.record.text);
                        last_printed_seq = Some(row.seq);
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("Shutting down...");
                break;
            }
        }
    }

    ctx.deselect(&resource);
    Ok(())
}

fn handle_input(
    dispatcher: &CommandDispatcher,
    ctx: &mut TelemetryContext,
    resource: &ResourceId,
    line: &str,
) {
    let action = match line {
        "/start" => Some(RequestAction::Start),
        "/stop" => Some(RequestAction::Stop),
        "/restart" => Some(RequestAction::Restart),
        "/eula" => Some(RequestAction::AcceptEula),
        "/backlog" => Some(RequestAction::ConsoleBacklog),
        "/state" => Some(RequestAction::StateSnapshot),
        "/clear" => {
            ctx.store.clear_console(resource);
            None
        }
        _ if line.starts_with('/') => {
            println!("Unknown control command: {}", line);
            None
        }
        _ => {
            dispatcher.send_command(&mut ctx.store, resource, line);
            None
        }
    };
    if let Some(action) = action {
        dispatcher.dispatch(&mut ctx.store, resource, action);
    }
}
