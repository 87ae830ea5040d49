use clap::{CommandFactory, Parser};
use comfy_table::{Attribute, Cell, Color, Table, presets::UTF8_FULL_CONDENSED};
use lazyhost::cli::{Cli, Command};
use lazyhost::protocol::{BackendInfo, BackendStatus, Decision, Request, Response};
use owo_colors::OwoColorize;
use std::path::Path;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();

    let Some(command) = cli.command else {
        Cli::command().print_help()?;
        return Ok(());
    };

    match command {
        Command::Daemon => {
            init_tracing();
            let paths = lazyhost::paths::Paths::new()?;
            lazyhost::daemon::run(paths, cli.config).await?;
        }
        Command::Check => check_config(&cli.config, cli.json)?,
        command => {
            let paths = lazyhost::paths::Paths::new()?;
            let request = command_to_request(command);
            let response = lazyhost::client::send_request(&paths, &request)?;
            if cli.json {
                print_response_json(&response)?;
            } else {
                print_response(&response);
            }
            if matches!(response, Response::Error { .. }) {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();
}

fn check_config(path: &Path, json: bool) -> color_eyre::Result<()> {
    let config = lazyhost::config::load_config(path)
        .map_err(|e| color_eyre::eyre::eyre!("{}: {e}", path.display()))?;
    let primary = config.primary().unwrap_or("-");
    if json {
        let summary = serde_json::json!({
            "backends": config.backends.keys().collect::<Vec<_>>(),
            "primary": primary,
            "forced_hosts": config.forced_hosts.len(),
        });
        println!("{summary}");
    } else {
        println!(
            "{} {} backends, primary {primary}",
            "config ok:".green(),
            config.backends.len()
        );
    }
    Ok(())
}

fn command_to_request(command: Command) -> Request {
    match command {
        Command::Status => Request::Status,
        Command::Start { name } => Request::Start { name },
        Command::Stop { name } => Request::Stop { name },
        Command::Hold { name, duration } => Request::Hold { name, duration },
        Command::Send { name, line } => Request::Send {
            name,
            line: line.join(" "),
        },
        Command::Ping { host } => Request::Ping { virtual_host: host },
        Command::Reload => Request::Reload,
        Command::Kill => Request::Kill,
        Command::Daemon | Command::Check => unreachable!("handled directly in main"),
    }
}

fn print_response_json(response: &Response) -> color_eyre::Result<()> {
    let json = serde_json::to_string(response)?;
    println!("{json}");
    Ok(())
}

fn status_color(status: BackendStatus) -> Color {
    match status {
        BackendStatus::Online => Color::Green,
        BackendStatus::Starting => Color::Yellow,
        BackendStatus::Stopping => Color::Magenta,
        BackendStatus::Offline => Color::Reset,
    }
}

fn print_response(response: &Response) {
    match response {
        Response::Success { message } => {
            if let Some(msg) = message {
                println!("{}", msg.green());
            } else {
                println!("{}", "ok".green());
            }
        }
        Response::Error { message } => {
            eprintln!("{} {}", "error:".red().bold(), message);
        }
        Response::BackendList { backends } => print_backends(backends),
        Response::Decision { decision } => match decision {
            Decision::Allow { backend } => println!("{} {backend}", "allow".green()),
            Decision::Deny { reason } => {
                println!("{} {}", "deny".red(), reason.as_deref().unwrap_or(""))
            }
        },
        Response::Ping { ping } => {
            let status = ping.status.to_string();
            println!("{} {}", status.bold(), ping.text);
        }
        Response::Directive { directive } => {
            println!("{} {:?}", format!("[{}]", directive.client()).cyan().bold(), directive);
        }
    }
}

fn print_backends(backends: &[BackendInfo]) {
    if backends.is_empty() {
        println!("{}", "no backends configured".yellow());
        return;
    }
    let mut table = Table::new();
    table.load_preset(UTF8_FULL_CONDENSED);
    table.set_header(vec![
        Cell::new("name").add_attribute(Attribute::Bold),
        Cell::new("status").add_attribute(Attribute::Bold),
        Cell::new("pid").add_attribute(Attribute::Bold),
        Cell::new("uptime").add_attribute(Attribute::Bold),
        Cell::new("clients").add_attribute(Attribute::Bold),
        Cell::new("hold").add_attribute(Attribute::Bold),
        Cell::new("idle stop").add_attribute(Attribute::Bold),
    ]);
    for b in backends {
        let name = if b.primary {
            format!("{} *", b.name)
        } else {
            b.name.clone()
        };
        let pid = b
            .pid
            .map(|id| id.to_string())
            .unwrap_or_else(|| "-".to_string());
        let hold = b
            .hold
            .map(|h| h.to_string())
            .unwrap_or_else(|| "-".to_string());
        let idle = if b.idle_stop_pending { "pending" } else { "-" };
        table.add_row(vec![
            Cell::new(&name).fg(Color::Cyan),
            Cell::new(b.status.to_string()).fg(status_color(b.status)),
            Cell::new(&pid),
            Cell::new(format_uptime(b.uptime)),
            Cell::new(b.clients.to_string()),
            Cell::new(&hold),
            Cell::new(idle),
        ]);
    }
    println!("{table}");
}

fn format_uptime(seconds: Option<u64>) -> String {
    match seconds {
        None => "-".to_string(),
        Some(s) if s < 60 => format!("{s}s"),
        Some(s) if s < 3600 => format!("{}m {}s", s / 60, s % 60),
        Some(s) if s < 86400 => format!("{}h {}m", s / 3600, (s % 3600) / 60),
        Some(s) => format!("{}d {}h", s / 86400, (s % 86400) / 3600),
    }
}
