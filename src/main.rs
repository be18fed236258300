use clap::{Parser, Subcommand};
use color_eyre::eyre::{self, bail, eyre, WrapErr};
use console::style;
use snoopsim::config::{Config, Protocol};
use snoopsim::packet::Packet;
use snoopsim::System;
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};

const MAX_CYCLES: u64 = 10_000_000;

#[derive(Debug, Subcommand)]
enum Command {
    /// Drive per-core access traces through the coherent system.
    ///
    /// Trace lines: `<core> R <hex-addr>` or `<core> W <hex-addr> <hex-byte>...`
    Run {
        /// configuration file (JSON); defaults apply when omitted
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,

        #[arg(short, long, value_name = "FILE")]
        trace: PathBuf,

        /// override the configured coherence protocol
        #[arg(short, long, value_enum)]
        protocol: Option<Protocol>,

        /// override the configured core count
        #[arg(long)]
        cores: Option<usize>,
    },
    /// Validate a configuration file and echo the resolved form.
    CheckConfig {
        #[arg(value_name = "FILE")]
        config: PathBuf,
    },
}

#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct Options {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug)]
struct TraceOp {
    core: usize,
    pkt: Packet,
}

fn parse_hex(value: &str) -> Result<u64, std::num::ParseIntError> {
    u64::from_str_radix(value.trim_start_matches("0x"), 16)
}

fn parse_trace(path: &Path) -> eyre::Result<Vec<TraceOp>> {
    let text = fs::read_to_string(path)
        .wrap_err_with(|| format!("cannot read trace {}", path.display()))?;
    let mut ops = Vec::new();
    for (number, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let context = || format!("trace line {}: {line:?}", number + 1);
        let mut fields = line.split_whitespace();

        let core_field = fields.next().ok_or_else(|| eyre!("{}: missing core id", context()))?;
        let core: usize = core_field.parse().wrap_err_with(context)?;
        let kind = fields.next().ok_or_else(|| eyre!("{}: missing R/W", context()))?;
        let addr_field = fields
            .next()
            .ok_or_else(|| eyre!("{}: missing address", context()))?;
        let addr = parse_hex(addr_field).wrap_err_with(context)?;

        let pkt = match kind {
            "R" | "r" => Packet::read(addr, 1).with_requestor(core),
            "W" | "w" => {
                let data = fields
                    .map(|field| parse_hex(field).map(|value| value as u8))
                    .collect::<Result<Vec<u8>, _>>()
                    .wrap_err_with(context)?;
                if data.is_empty() {
                    bail!("{}: write without data", context());
                }
                Packet::write(addr, data).with_requestor(core)
            }
            other => bail!("{}: unknown op {other:?}", context()),
        };
        ops.push(TraceOp { core, pkt });
    }
    Ok(ops)
}

fn load_config(path: Option<&Path>) -> eyre::Result<Config> {
    match path {
        Some(path) => {
            let text = fs::read_to_string(path)
                .wrap_err_with(|| format!("cannot read config {}", path.display()))?;
            serde_json::from_str(&text).wrap_err("malformed configuration")
        }
        None => Ok(Config::default()),
    }
}

fn run(
    config: Option<&Path>,
    trace: &Path,
    protocol: Option<Protocol>,
    cores: Option<usize>,
) -> eyre::Result<()> {
    let mut config = load_config(config)?;
    if let Some(protocol) = protocol {
        config.coherence.protocol = protocol;
    }
    if let Some(cores) = cores {
        config.num_cores = cores;
    }

    let mut queues: Vec<VecDeque<Packet>> = vec![VecDeque::new(); config.num_cores];
    for op in parse_trace(trace)? {
        if op.core >= config.num_cores {
            bail!(
                "trace uses core {} but only {} cores are configured",
                op.core,
                config.num_cores
            );
        }
        queues[op.core].push_back(op.pkt);
    }

    let mut system = System::new(&config)?;
    let mut outstanding = vec![false; config.num_cores];

    // each core issues its trace in order, retrying refused requests
    loop {
        let mut idle = true;
        for core in 0..config.num_cores {
            if outstanding[core] && system.pop_response(core).is_some() {
                outstanding[core] = false;
            }
            if outstanding[core] {
                idle = false;
                continue;
            }
            if let Some(pkt) = queues[core].front() {
                idle = false;
                if system.recv_timing_req(core, pkt.clone()) {
                    queues[core].pop_front();
                    outstanding[core] = true;
                }
            }
        }
        if idle && !system.busy() {
            break;
        }
        system.tick();
        if system.clock > MAX_CYCLES {
            bail!("trace did not finish within {MAX_CYCLES} cycles");
        }
    }

    let stats = system.stats();
    eprintln!(
        "{}",
        style(format!(
            "{:?}: {} cores, {} cycles, {} bus transactions",
            config.coherence.protocol, config.num_cores, stats.cycles, stats.bus.transactions
        ))
        .green()
    );
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

fn main() -> eyre::Result<()> {
    color_eyre::install()?;
    env_logger::init();

    let options = Options::parse();
    match options.command {
        Command::Run {
            config,
            trace,
            protocol,
            cores,
        } => run(config.as_deref(), &trace, protocol, cores),
        Command::CheckConfig { config } => {
            let parsed = load_config(Some(&config))?;
            parsed.validate()?;
            println!("{}", serde_json::to_string_pretty(&parsed)?);
            Ok(())
        }
    }
}
