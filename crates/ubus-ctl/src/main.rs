//! ubus-ctl — command-line debugging tool for a ubus bus.
//!
//! Joins the bus as an ordinary participant named `ubus-ctl-<pid>` and
//! leaves again when the command finishes.

use anyhow::{bail, Context, Result};

use ubus_core::config::UbusConfig;
use ubus_core::control::{EventListing, MethodListing, ParticipantListing};
use ubus_runtime::Runtime;

// ── Arguments ─────────────────────────────────────────────────────────────────

#[derive(Debug, PartialEq, Eq)]
enum ListKind {
    Event,
    Participant,
    Method,
}

#[derive(Debug, PartialEq, Eq)]
enum Command {
    List(ListKind),
    Echo(String),
    Request {
        method: String,
        request_type: u32,
        response_type: u32,
        body: String,
    },
    Help,
}

#[derive(Debug, PartialEq, Eq)]
struct Args {
    master_ip: Option<String>,
    master_port: Option<u16>,
    command: Command,
}

fn parse_args(args: &[String]) -> Result<Args> {
    let mut master_ip = None;
    let mut master_port = None;
    let mut remaining: Vec<&str> = Vec::new();
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--master-ip" => {
                i += 1;
                master_ip = Some(args.get(i).context("--master-ip requires a value")?.clone());
            }
            "--master-port" => {
                i += 1;
                master_port = Some(
                    args.get(i)
                        .context("--master-port requires a value")?
                        .parse()
                        .context("--master-port must be a number")?,
                );
            }
            other => remaining.push(other),
        }
        i += 1;
    }

    let command = match remaining.as_slice() {
        ["list", "event"] => Command::List(ListKind::Event),
        ["list", "participant"] => Command::List(ListKind::Participant),
        ["list", "method"] => Command::List(ListKind::Method),
        ["echo", topic] => Command::Echo(topic.to_string()),
        ["request", method, req, resp, body] => Command::Request {
            method: method.to_string(),
            request_type: req.parse().context("request type must be a number")?,
            response_type: resp.parse().context("response type must be a number")?,
            body: body.to_string(),
        },
        ["help"] | ["--help"] | ["-h"] | [] => Command::Help,
        other => bail!("unknown command: {}", other.join(" ")),
    };

    Ok(Args {
        master_ip,
        master_port,
        command,
    })
}

fn print_usage() {
    println!("Usage: ubus-ctl [--master-ip <ip>] [--master-port <port>] <command>");
    println!();
    println!("Commands:");
    println!("  list event                                  List registered events");
    println!("  list participant                            List joined participants");
    println!("  list method                                 List provided methods");
    println!("  echo <topic>                                Print every event on a topic");
    println!("  request <method> <req_type> <resp_type> <body>");
    println!("                                              Call a method and print the reply");
    println!();
    println!("Options:");
    println!("  --master-ip <ip>       Master address (default: from config)");
    println!("  --master-port <port>   Master port (default: from config)");
}

// ── Subcommand handlers ───────────────────────────────────────────────────────

fn print_events(rows: &[EventListing]) {
    if rows.is_empty() {
        println!("No events registered.");
        return;
    }
    println!("{:<24} {:>6}  {:<20} SUBSCRIBERS", "NAME", "TYPE", "PUBLISHER");
    for e in rows {
        println!(
            "{:<24} {:>6}  {:<20} {}",
            e.name,
            e.type_id,
            e.publisher,
            e.subscribers.join(",")
        );
    }
}

fn print_participants(rows: &[ParticipantListing], own_name: &str) {
    let rows: Vec<_> = rows.iter().filter(|p| p.name != own_name).collect();
    if rows.is_empty() {
        println!("No participants joined.");
        return;
    }
    println!("{:<24} {:<22} LISTENING", "NAME", "CONTROL");
    for p in rows {
        println!(
            "{:<24} {:<22} {}:{}",
            p.name,
            format!("{}:{}", p.ip, p.port),
            p.listening_ip,
            p.listening_port
        );
    }
}

fn print_methods(rows: &[MethodListing]) {
    if rows.is_empty() {
        println!("No methods provided.");
        return;
    }
    println!("{:<24} {:>8} {:>8}  PROVIDER", "NAME", "REQUEST", "RESPONSE");
    for m in rows {
        println!(
            "{:<24} {:>8} {:>8}  {}",
            m.name, m.request_type, m.response_type, m.provider
        );
    }
}

async fn cmd_list(rt: &Runtime, kind: ListKind) -> Result<()> {
    match kind {
        ListKind::Event => print_events(&rt.list_events().await?),
        ListKind::Participant => {
            let own = rt.name().unwrap_or_default();
            print_participants(&rt.list_participants().await?, &own)
        }
        ListKind::Method => print_methods(&rt.list_methods().await?),
    }
    Ok(())
}

async fn cmd_echo(rt: &Runtime, topic: &str) -> Result<()> {
    let events = rt.list_events().await?;
    let Some(event) = events.iter().find(|e| e.name == topic) else {
        bail!("topic {topic} is not published");
    };

    let name = topic.to_string();
    rt.subscribe_raw(topic, event.type_id, move |payload: &[u8]| {
        println!("[{name}] {}", String::from_utf8_lossy(payload));
    })
    .await
    .with_context(|| format!("failed to subscribe to {topic}"))?;
    println!("Listening on {topic} (type {}), Ctrl-C to stop.", event.type_id);

    tokio::signal::ctrl_c().await.ok();
    Ok(())
}

async fn cmd_request(
    rt: &Runtime,
    method: &str,
    request_type: u32,
    response_type: u32,
    body: &str,
) -> Result<()> {
    let response = rt
        .call_method_raw(method, request_type, response_type, body.as_bytes())
        .await
        .with_context(|| format!("call to {method} failed"))?;
    println!("{}", String::from_utf8_lossy(&response));
    Ok(())
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let raw: Vec<String> = std::env::args().skip(1).collect();
    let args = match parse_args(&raw) {
        Ok(a) => a,
        Err(e) => {
            eprintln!("{e:#}");
            eprintln!();
            print_usage();
            std::process::exit(1);
        }
    };
    if args.command == Command::Help {
        print_usage();
        return Ok(());
    }

    let config = UbusConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        UbusConfig::default()
    });
    let master_ip = args.master_ip.unwrap_or(config.runtime.master_ip.clone());
    let master_port = args.master_port.unwrap_or(config.runtime.master_port);

    let rt = Runtime::new(config.runtime);
    let name = format!("ubus-ctl-{}", std::process::id());
    rt.init(&name, &master_ip, master_port)
        .await
        .with_context(|| format!("failed to join bus at {master_ip}:{master_port}"))?;

    let result = match args.command {
        Command::List(kind) => cmd_list(&rt, kind).await,
        Command::Echo(topic) => cmd_echo(&rt, &topic).await,
        Command::Request {
            method,
            request_type,
            response_type,
            body,
        } => cmd_request(&rt, &method, request_type, response_type, &body).await,
        Command::Help => Ok(()),
    };

    rt.shutdown().await;
    result
}
