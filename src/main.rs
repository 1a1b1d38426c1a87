pub mod models {
    pub mod cosa;
    pub mod snapshot;
}

pub mod client;
pub mod config;
pub mod entities;
pub mod mapping;
pub mod utils;
pub mod services {
    pub mod poller;
    pub mod simulate;
    pub mod sync;
}

use crate::client::{CosaApi, CosaClient, Credentials, RemoteDevice};
use crate::config::Config;
use crate::models::cosa::{EndpointId, PlaceId};
use crate::services::poller::{self, WriteRequest};
use crate::services::simulate::{DEFAULT_SEED, SimulatedThermostat};
use crate::services::sync::StateSynchronizer;
use log::{debug, error, info, warn};
use std::cell::RefCell;
use std::ffi::OsString;
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread;

#[derive(Debug, Default, PartialEq)]
struct CliArgs {
    env_file: Option<PathBuf>,
    simulate: bool,
    once: bool,
    writes: Vec<WriteRequest>,
}

fn set_env_file(cli: &mut CliArgs, path: &str) -> Result<(), String> {
    if cli.env_file.is_some() {
        return Err("`--env-file` provided more than once".to_string());
    }
    if path.is_empty() {
        return Err("`--env-file` requires a path argument".to_string());
    }
    cli.env_file = Some(PathBuf::from(path));
    Ok(())
}

fn parse_args(args: impl IntoIterator<Item = OsString>) -> Result<CliArgs, String> {
    let mut args = args.into_iter();
    let mut cli = CliArgs::default();

    while let Some(arg) = args.next() {
        let arg = arg.into_string().map_err(|_| "argument contains invalid UTF-8".to_string())?;
        match arg.as_str() {
            "--simulate" => cli.simulate = true,
            "--once" => cli.once = true,
            "--env-file" | "--set" => {
                let value = args
                    .next()
                    .and_then(|v| v.into_string().ok())
                    .ok_or_else(|| format!("`{}` requires an argument", arg))?;
                if arg == "--set" {
                    cli.writes.push(value.parse()?);
                } else {
                    set_env_file(&mut cli, &value)?;
                }
            }
            s if s.starts_with("--env-file=") => set_env_file(&mut cli, &s["--env-file=".len()..])?,
            s if s.starts_with("--set=") => cli.writes.push(s["--set=".len()..].parse()?),
            "--" => break,
            other => return Err(format!("unrecognised argument: {}", other)),
        }
    }
    Ok(cli)
}

/// Merge `KEY=value` lines from `path` into the process environment.
/// Variables that are already set win over the file.
fn load_env_file(path: &Path) -> Result<(), String> {
    let contents = std::fs::read_to_string(path).map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
    for (index, line) in contents.lines().enumerate() {
        let parsed = parse_env_line(line).map_err(|e| format!("{}:{}: {}", path.display(), index + 1, e))?;
        if let Some((key, value)) = parsed {
            if std::env::var_os(&key).is_none() {
                // Updating process-level environment variables is unsafe on some targets.
                unsafe {
                    std::env::set_var(key, value);
                }
            }
        }
    }
    Ok(())
}

fn parse_env_line(line: &str) -> Result<Option<(String, String)>, String> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    let line = line.strip_prefix("export ").map(str::trim_start).unwrap_or(line);
    let (key, raw) = line.split_once('=').ok_or_else(|| "missing '=' in assignment".to_string())?;
    let key = key.trim();
    if key.is_empty() || key.chars().any(char::is_whitespace) {
        return Err(format!("invalid environment variable name: {:?}", key));
    }

    let raw = raw.trim();
    let value = match raw.chars().next() {
        Some(quote @ ('"' | '\'')) => unquote(&raw[1..], quote)?,
        _ => raw.split('#').next().unwrap_or_default().trim_end().to_string(),
    };
    Ok(Some((key.to_string(), value)))
}

/// Read a quoted value up to its closing `quote`. Escapes apply inside double quotes only.
fn unquote(input: &str, quote: char) -> Result<String, String> {
    let mut value = String::new();
    let mut chars = input.chars();
    while let Some(ch) = chars.next() {
        match ch {
            '\\' if quote == '"' => {
                let escaped = chars.next().ok_or("unterminated escape sequence")?;
                value.push(match escaped {
                    'n' => '\n',
                    'r' => '\r',
                    't' => '\t',
                    other => other,
                });
            }
            c if c == quote => {
                let rest = chars.as_str().trim();
                return if rest.is_empty() || rest.starts_with('#') {
                    Ok(value)
                } else {
                    Err(format!("unexpected characters after closing {}", quote))
                };
            }
            c => value.push(c),
        }
    }
    Err(format!("unterminated {}-quoted value", quote))
}

/// Returns the path of the env file that was loaded, if any.
fn load_env(cli: &CliArgs) -> Result<Option<PathBuf>, String> {
    let path = match &cli.env_file {
        Some(path) if !path.is_file() => return Err(format!("env file not found: {}", path.display())),
        Some(path) => path.clone(),
        None => {
            let cwd = std::env::current_dir().map_err(|e| format!("unable to read current directory: {}", e))?;
            let default_path = cwd.join(".env");
            if !default_path.is_file() {
                return Ok(None);
            }
            default_path
        }
    };
    load_env_file(&path)?;
    Ok(Some(path))
}

fn discover_endpoint(client: &CosaClient) -> Result<EndpointId, String> {
    let endpoints = client
        .get_endpoints()
        .map_err(|e| format!("getEndpoints failed: {}", e))?;
    info!("Discovered {} endpoint(s)", endpoints.len());
    for ep in &endpoints {
        debug!(
            "Endpoint {:?} ({})",
            ep.endpoint_id().map(|id| id.0),
            ep.name.as_deref().unwrap_or("unnamed")
        );
    }
    endpoints
        .iter()
        .find_map(|ep| ep.endpoint_id())
        .ok_or_else(|| "No thermostats found; set COSA_ENDPOINT_ID or add a device to the account".to_string())
}

fn spawn_command_reader(tx: mpsc::Sender<WriteRequest>) {
    thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match line.parse::<WriteRequest>() {
                Ok(request) => {
                    if tx.send(request).is_err() {
                        break;
                    }
                }
                Err(e) => warn!("Ignoring command {:?}: {}", line, e),
            }
        }
    });
}

fn drive<A: CosaApi>(api: A, cfg: &Config, cli: CliArgs) -> Result<(), String> {
    let pending_timeout = chrono::Duration::from_std(cfg.pending_write_timeout)
        .map_err(|e| format!("PENDING_WRITE_TIMEOUT_SECS out of range: {}", e))?;
    let mut sync = StateSynchronizer::new(api, pending_timeout);

    let last_summary = RefCell::new(String::new());
    sync.on_update(move |snapshot, available| {
        let summary = entities::project(snapshot, available).summary();
        if *last_summary.borrow() != summary {
            info!("{}", summary);
            last_summary.replace(summary);
        }
    });

    if cli.once {
        poller::run_loop(&mut sync, cfg.poll_interval, Some(1), None)?;
        for request in &cli.writes {
            poller::apply_write(&mut sync, request);
        }
        if sync.take_refresh_request() {
            poller::run_loop(&mut sync, cfg.poll_interval, Some(1), None)?;
        }
        let states = entities::project(sync.snapshot(), sync.available());
        let json = serde_json::to_string_pretty(&states).map_err(|e| format!("rendering entities failed: {}", e))?;
        println!("{}", json);
        return Ok(());
    }

    let (tx, rx) = mpsc::channel();
    for request in cli.writes {
        tx.send(request).map_err(|e| format!("queueing write failed: {}", e))?;
    }
    spawn_command_reader(tx);

    info!(
        "Starting poll loop: interval={}s, pending_write_timeout={}s",
        cfg.poll_interval.as_secs(),
        cfg.pending_write_timeout.as_secs()
    );
    poller::run_loop(&mut sync, cfg.poll_interval, None, Some(&rx))
}

fn run(cli: CliArgs) -> Result<(), String> {
    // 1) Load config
    let cfg = Config::from_env()?;
    let simulate = cli.simulate || cfg.simulate;
    info!(
        "Config loaded (poll_interval={}s, pending_write_timeout={}s, api_timeout={}s, reports_enabled={}, simulate={}, endpoint={}, place={})",
        cfg.poll_interval.as_secs(),
        cfg.pending_write_timeout.as_secs(),
        cfg.api_timeout.as_secs(),
        cfg.reports_enabled,
        simulate,
        utils::fmt_opt(cfg.endpoint_id.as_deref()),
        utils::fmt_opt(cfg.place_id.as_deref()),
    );

    if simulate {
        info!("Using simulated thermostat (seed {:#x})", DEFAULT_SEED);
        let sim = SimulatedThermostat::new(DEFAULT_SEED, cfg.poll_interval);
        return drive(sim, &cfg, cli);
    }

    // 2) Authenticate
    let credentials = match (&cfg.email, &cfg.password) {
        (Some(email), Some(password)) => Some(Credentials {
            email: email.clone(),
            password: password.clone(),
        }),
        _ => None,
    };
    let client = CosaClient::new(&cfg.api_base_url, cfg.api_timeout, cfg.token.clone(), credentials)
        .map_err(|e| format!("COSA auth failed: {}", e))?;
    info!("Authenticated to COSA API at {}", cfg.api_base_url);

    // 3) Pick the thermostat
    let endpoint = match &cfg.endpoint_id {
        Some(id) => EndpointId(id.clone()),
        None => discover_endpoint(&client)?,
    };
    info!("Synchronizing endpoint {}", endpoint.0);

    let device = RemoteDevice {
        client,
        endpoint,
        place: cfg.place_id.clone().map(PlaceId),
        reports_enabled: cfg.reports_enabled,
    };
    drive(device, &cfg, cli)
}

fn main() {
    let setup = parse_args(std::env::args_os().skip(1)).and_then(|cli| load_env(&cli).map(|loaded| (cli, loaded)));
    let (cli, loaded_env) = match setup {
        Ok(v) => v,
        Err(err) => {
            eprintln!("fatal: {}", err);
            std::process::exit(1);
        }
    };

    // Init logging after environment so RUST_LOG from .env is respected.
    let default_filter = env_logger::Env::default().default_filter_or("info");
    env_logger::Builder::from_env(default_filter)
        .format_timestamp_secs()
        .init();

    if let Some(path) = loaded_env.as_ref() {
        info!("Environment loaded from {}", path.display());
    }

    info!(
        "cosa-sync {} (git {}) starting",
        env!("CARGO_PKG_VERSION"),
        env!("BUILD_TIME_GIT_HASH")
    );
    if let Err(e) = run(cli) {
        error!("fatal: {}", e);
        std::process::exit(1);
    }
}
