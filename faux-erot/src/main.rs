// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use clap::Subcommand;
use clap::ValueEnum;
use erot_comms::sim::SimConfig;
use erot_comms::sim::SimFaults;
use erot_comms::sim::SimulatedErot;
use erot_comms::BindingConfig;
use erot_comms::BroadcastResult;
use erot_comms::EndpointRegistry;
use erot_comms::ExecuteSummary;
use erot_comms::RetryConfig;
use erot_comms::TaskEngine;
use erot_comms::UpdateConfig;
use erot_messages::command::CommandError;
use erot_messages::command::RESPONSE_HEADER_SIZE;
use erot_messages::fw_update::DeviceIdentifiers;
use erot_messages::fw_update::FirmwareParameters;
use erot_messages::fw_update::FwUpdateCommand;
use erot_messages::package::Package;
use erot_messages::CommandHeader;
use erot_messages::MessageType;
use erot_messages::FW_PARAMS_BUFFER_SIZE;
use indicatif::ProgressBar;
use indicatif::ProgressStyle;
use serde_json::json;
use slog::info;
use slog::o;
use slog::Drain;
use slog::Level;
use slog::Logger;
use slog_async::AsyncGuard;
use std::collections::BTreeMap;
use std::fs;
use std::fs::File;
use std::io;
use std::mem;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

/// Command line program that inspects EROT update packages and drives
/// simulated EROTs through the host-side update stack.
#[derive(Parser, Debug)]
struct Args {
    #[clap(
        short,
        long,
        default_value = "info",
        value_parser = level_from_str,
        help = "Log level: {off,critical,error,warn,info,debug,trace}",
    )]
    log_level: Level,

    /// Write logs to a file instead of stderr.
    #[clap(long)]
    logfile: Option<PathBuf>,

    /// Emit parseable JSON on stdout instead of "human-readable" data.
    #[clap(long, value_names = ["pretty"], value_parser = json_pretty_from_str)]
    json: Option<Option<JsonPretty>>,

    /// Maximum number of attempts for each request.
    #[clap(long, default_value = "3")]
    max_attempts: usize,

    /// Timeout (in milliseconds) for each attempt.
    #[clap(long, default_value = "100")]
    per_attempt_timeout_millis: u64,

    #[clap(subcommand)]
    command: Command,
}

fn level_from_str(s: &str) -> Result<Level> {
    if let Ok(level) = s.parse() {
        Ok(level)
    } else {
        bail!(format!("Invalid log level: {}", s))
    }
}

#[derive(Debug, Clone, Copy)]
struct JsonPretty;

fn json_pretty_from_str(s: &str) -> Result<JsonPretty> {
    if s == "pretty" {
        Ok(JsonPretty)
    } else {
        bail!("expected \"pretty\"")
    }
}

#[derive(Subcommand, Debug, Clone)]
enum Command {
    /// Parse and validate an update package and print its contents.
    Inspect { package: PathBuf },

    /// Write an update package that matches the simulated EROTs.
    DemoPackage {
        #[clap(long)]
        out: PathBuf,

        /// Size of each component image in bytes.
        #[clap(long, default_value_t = 16 * 1024)]
        image_size: usize,
    },

    /// Identify simulated EROTs and read their firmware parameters.
    Query {
        #[clap(long, default_value_t = 1)]
        devices: u8,
    },

    /// Update simulated EROTs from a package.
    Update {
        package: PathBuf,

        #[clap(long, default_value_t = 1)]
        devices: u8,

        /// Inject `--fault` into the EROT on this socket.
        #[clap(long)]
        fail_socket: Option<u8>,

        #[clap(long, value_enum, default_value_t = Fault::Silent)]
        fault: Fault,

        /// How long to wait for the device to ask for data (e.g. "90s").
        #[clap(long)]
        fd_idle_timeout: Option<humantime::Duration>,

        /// Leave the device in update mode when an update fails.
        #[clap(long)]
        no_cancel: bool,
    },
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum Fault {
    Silent,
    OversizeParameters,
    WillNotUpdate,
    FailVerify,
}

impl From<Fault> for SimFaults {
    fn from(fault: Fault) -> Self {
        let mut faults = SimFaults::default();
        match fault {
            Fault::Silent => faults.silent = true,
            Fault::OversizeParameters => faults.oversize_parameters = true,
            Fault::WillNotUpdate => faults.will_not_update = true,
            Fault::FailVerify => faults.fail_verify = true,
        }
        faults
    }
}

fn build_logger(
    level: Level,
    path: Option<&Path>,
) -> Result<(Logger, AsyncGuard)> {
    fn make_drain<D: slog_term::Decorator + Send + 'static>(
        level: Level,
        decorator: D,
    ) -> (slog::Fuse<slog_async::Async>, AsyncGuard) {
        let drain = slog_term::FullFormat::new(decorator)
            .build()
            .filter_level(level)
            .fuse();
        let (drain, guard) = slog_async::Async::new(drain).build_with_guard();
        (drain.fuse(), guard)
    }

    let (drain, guard) = if let Some(path) = path {
        let file = File::create(path).with_context(|| {
            format!("failed to create logfile {}", path.display())
        })?;
        make_drain(level, slog_term::PlainDecorator::new(file))
    } else {
        make_drain(level, slog_term::TermDecorator::new().build())
    };

    Ok((Logger::root(drain, o!("component" => "faux-erot")), guard))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let (log, log_guard) =
        build_logger(args.log_level, args.logfile.as_deref())?;

    let retry_config = RetryConfig {
        per_attempt_timeout: Duration::from_millis(
            args.per_attempt_timeout_millis,
        ),
        max_attempts: args.max_attempts,
        ..Default::default()
    };
    let json = args.json.is_some();

    let (output, did_fail) = match args.command.clone() {
        Command::Inspect { package } => (inspect(&package, json)?, false),
        Command::DemoPackage { out, image_size } => {
            (demo_package(&out, image_size, json)?, false)
        }
        Command::Query { devices } => {
            query(devices, retry_config, json, &log).await?
        }
        Command::Update {
            package,
            devices,
            fail_socket,
            fault,
            fd_idle_timeout,
            no_cancel,
        } => {
            let mut config = UpdateConfig {
                cancel_on_failure: !no_cancel,
                ..Default::default()
            };
            if let Some(timeout) = fd_idle_timeout {
                config.fd_idle_timeout = timeout.into();
            }
            let faults = fail_socket.map(|socket| (socket, fault.into()));
            update(&package, devices, faults, config, retry_config, json, &log)
                .await?
        }
    };

    match (output, args.json) {
        (Output::Json(value), Some(Some(JsonPretty))) => {
            serde_json::to_writer_pretty(io::stdout().lock(), &value)
                .context("failed to write to stdout")?;
        }
        (Output::Json(value), _) => {
            serde_json::to_writer(io::stdout().lock(), &value)
                .context("failed to write to stdout")?;
        }
        (Output::Lines(lines), _) => {
            for line in lines {
                println!("{line}");
            }
        }
    }

    if did_fail {
        mem::drop(log_guard);
        std::process::exit(1);
    }

    Ok(())
}

enum Output {
    Json(serde_json::Value),
    Lines(Vec<String>),
}

fn inspect(path: &Path, json: bool) -> Result<Output> {
    let data = fs::read(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let package = Package::parse(&data)
        .with_context(|| format!("invalid package {}", path.display()))?;

    let records = package
        .device_records()
        .map(|record| {
            let descriptors = record
                .descriptors()
                .map(|d| {
                    d.map(|d| {
                        json!({
                            "type": d.descriptor_type,
                            "data": hex::encode(d.data),
                        })
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            let applicable = (0..package.component_count())
                .filter(|&i| record.is_applicable(i))
                .collect::<Vec<_>>();
            Ok(json!({
                "image_set_version": record.image_set_version.as_str(),
                "update_option_flags": record.update_option_flags,
                "descriptors": descriptors,
                "applicable_components": applicable,
                "package_data_len": record.package_data.len(),
            }))
        })
        .collect::<Result<Vec<_>, CommandError>>()
        .context("invalid descriptor in device record")?;

    let components = package
        .components()
        .map(|c| {
            json!({
                "index": c.index,
                "classification": c.classification,
                "identifier": c.identifier,
                "comparison_stamp": c.comparison_stamp,
                "options": c.options.bits(),
                "requested_activation_method":
                    c.requested_activation_method.bits(),
                "offset": c.location_offset,
                "size": c.size,
                "version": c.version.as_str(),
            })
        })
        .collect::<Vec<_>>();

    if json {
        return Ok(Output::Json(json!({
            "identifier": package.identifier().to_string(),
            "format_revision": package.format_revision(),
            "version": package.version().as_str(),
            "release_date_time": hex::encode(package.release_date_time()),
            "len": package.len(),
            "device_records": records,
            "components": components,
        })));
    }

    let mut lines = vec![
        format!("identifier:      {}", package.identifier()),
        format!("format revision: {}", package.format_revision()),
        format!("version:         {}", package.version().as_str()),
        format!("length:          {}", package.len()),
    ];
    for (i, record) in package.device_records().enumerate() {
        lines.push(format!(
            "device record {i}: image set {}",
            record.image_set_version.as_str()
        ));
        for descriptor in record.descriptors().flatten() {
            lines.push(format!(
                "    descriptor {:#06x}: {}",
                descriptor.descriptor_type,
                hex::encode(descriptor.data)
            ));
        }
        let applicable = (0..package.component_count())
            .filter(|&c| record.is_applicable(c))
            .map(|c| c.to_string())
            .collect::<Vec<_>>();
        lines.push(format!("    components: {}", applicable.join(", ")));
    }
    for c in package.components() {
        lines.push(format!(
            "component {}: class {:#06x} id {:#06x} version {} ({} bytes, \
             activation {:?})",
            c.index,
            c.classification,
            c.identifier,
            c.version.as_str(),
            c.size,
            c.requested_activation_method,
        ));
    }
    Ok(Output::Lines(lines))
}

fn demo_package(out: &Path, image_size: usize, json: bool) -> Result<Output> {
    let data = SimConfig::default().matching_package(image_size);
    fs::write(out, &data)
        .with_context(|| format!("failed to write {}", out.display()))?;
    if json {
        Ok(Output::Json(json!({
            "path": out.display().to_string(),
            "len": data.len(),
        })))
    } else {
        Ok(Output::Lines(vec![format!(
            "wrote {} bytes to {}",
            data.len(),
            out.display()
        )]))
    }
}

async fn simulated_registry(
    devices: u8,
    retry_config: RetryConfig,
    log: &Logger,
) -> Result<(EndpointRegistry, Vec<SimulatedErot>)> {
    let mut registry = EndpointRegistry::init(
        usize::from(devices),
        BindingConfig::default(),
        retry_config,
        log,
    );
    let mut sims = Vec::with_capacity(usize::from(devices));
    for socket in 0..devices {
        let sim = SimulatedErot::new(SimConfig::default());
        registry
            .add_endpoint(
                Box::new(sim.clone()),
                socket,
                socket,
                Box::new(sim.clone()),
            )
            .await
            .with_context(|| {
                format!("failed to probe simulated EROT on socket {socket}")
            })?;
        sims.push(sim);
    }
    info!(log, "simulated EROTs ready"; "count" => devices);
    Ok((registry, sims))
}

fn response_ok(response: &[u8]) -> bool {
    matches!(
        CommandHeader::read_response(response),
        Ok((_, code, _)) if code.is_success()
    )
}

async fn query(
    devices: u8,
    retry_config: RetryConfig,
    json: bool,
    log: &Logger,
) -> Result<(Output, bool)> {
    let (mut registry, _sims) =
        simulated_registry(devices, retry_config, log).await?;

    let identifiers = registry
        .broadcast_request(
            MessageType::FwUpdate,
            FwUpdateCommand::QueryDeviceIdentifiers as u8,
            &[],
            256,
            |_, _, response| response_ok(response),
        )
        .await;
    let parameters = registry
        .broadcast_request(
            MessageType::FwUpdate,
            FwUpdateCommand::GetFirmwareParameters as u8,
            &[],
            RESPONSE_HEADER_SIZE + FW_PARAMS_BUFFER_SIZE,
            |_, _, response| response_ok(response),
        )
        .await;
    registry.deinit();

    let mut by_device = BTreeMap::new();
    let mut lines = Vec::new();
    let mut did_fail = false;
    for (ids, params) in identifiers.iter().zip(&parameters) {
        match describe_device(ids, params) {
            Ok((value, device_lines)) => {
                lines.extend(
                    device_lines
                        .into_iter()
                        .map(|line| format!("{} {line}", ids.name)),
                );
                by_device.insert(ids.name.clone(), Ok(value));
            }
            Err(err) => {
                did_fail = true;
                lines.push(format!("{} Error: {err:#}", ids.name));
                by_device.insert(ids.name.clone(), Err(format!("{err:#}")));
            }
        }
    }

    if json {
        Ok((Output::Json(serde_json::to_value(by_device)?), did_fail))
    } else {
        Ok((Output::Lines(lines), did_fail))
    }
}

fn describe_device(
    ids: &BroadcastResult,
    params: &BroadcastResult,
) -> Result<(serde_json::Value, Vec<String>)> {
    let response = ids
        .result
        .as_ref()
        .map_err(Clone::clone)
        .context("query device identifiers failed")?;
    let (_, _, body) = CommandHeader::read_response(response)?;
    let ids = DeviceIdentifiers::decode(body)
        .context("malformed device identifiers")?;
    let descriptors = ids
        .iter()
        .collect::<Result<Vec<_>, _>>()
        .context("malformed descriptor")?;

    let response = params
        .result
        .as_ref()
        .map_err(Clone::clone)
        .context("get firmware parameters failed")?;
    let (_, _, body) = CommandHeader::read_response(response)?;
    let params = FirmwareParameters::decode(body)
        .context("malformed firmware parameters")?;

    let active = String::from_utf8_lossy(params.active_version);
    let pending = String::from_utf8_lossy(params.pending_version);
    let mut lines = vec![format!("active {active}, pending {pending}")];
    for d in &descriptors {
        lines.push(format!(
            "descriptor {:#06x}: {}",
            d.descriptor_type,
            hex::encode(d.data)
        ));
    }

    let mut components = Vec::new();
    for c in params.components() {
        let active = String::from_utf8_lossy(c.active_version);
        let pending = String::from_utf8_lossy(c.pending_version);
        lines.push(format!(
            "component class {:#06x} id {:#06x}: active {active}, \
             pending {pending}, activation {:?}",
            c.header.classification,
            c.header.identifier,
            c.header.activation_methods,
        ));
        components.push(json!({
            "classification": c.header.classification,
            "identifier": c.header.identifier,
            "classification_index": c.header.classification_index,
            "active_version": active,
            "pending_version": pending,
            "activation_methods": c.header.activation_methods.bits(),
        }));
    }

    let value = json!({
        "descriptors": descriptors
            .iter()
            .map(|d| json!({
                "type": d.descriptor_type,
                "data": hex::encode(d.data),
            }))
            .collect::<Vec<_>>(),
        "active_version": active,
        "pending_version": pending,
        "components": components,
    });
    Ok((value, lines))
}

async fn update(
    path: &Path,
    devices: u8,
    faults: Option<(u8, SimFaults)>,
    config: UpdateConfig,
    retry_config: RetryConfig,
    json: bool,
    log: &Logger,
) -> Result<(Output, bool)> {
    let data = fs::read(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let (mut registry, sims) =
        simulated_registry(devices, retry_config, log).await?;
    if let Some((socket, faults)) = faults {
        let sim = sims.get(usize::from(socket)).with_context(|| {
            format!("no simulated EROT on socket {socket}")
        })?;
        info!(log, "injecting fault"; "socket" => socket, "faults" => ?faults);
        sim.set_faults(faults);
    }

    let bar = if json { ProgressBar::hidden() } else { ProgressBar::new(100) };
    bar.set_style(
        ProgressStyle::with_template("{msg} [{bar:40}] {pos:>3}%")?
            .progress_chars("=> "),
    );
    bar.set_message("updating");
    let progress = bar.clone();

    let mut engine = TaskEngine::init(
        config,
        Some(Box::new(move |percent| progress.set_position(u64::from(percent)))),
        log,
    );
    for handle in registry.handles() {
        engine
            .create_task(&registry, handle, &data)
            .context("failed to create update task")?;
    }
    let summary = engine.execute_all(&mut registry).await;
    engine.deinit();
    registry.deinit();

    if summary.all_succeeded() {
        bar.finish_with_message("updated");
    } else {
        bar.abandon_with_message("failed");
    }

    let did_fail = !summary.all_succeeded();
    let output = if json {
        Output::Json(summary_to_json(&summary))
    } else {
        Output::Lines(summary_to_lines(&summary))
    };
    Ok((output, did_fail))
}

fn summary_to_json(summary: &ExecuteSummary) -> serde_json::Value {
    let outcomes = summary
        .outcomes
        .iter()
        .map(|outcome| {
            let result = match &outcome.result {
                Ok(methods) => json!({ "ok": methods.bits() }),
                Err(err) => json!({
                    "err": format!("{:#}", anyhow::Error::new(err.clone())),
                }),
            };
            json!({
                "name": outcome.name,
                "socket": outcome.socket,
                "stage": <&'static str>::from(outcome.stage),
                "result": result,
            })
        })
        .collect::<Vec<_>>();
    json!({
        "activation_methods": summary.activation_methods.bits(),
        "outcomes": outcomes,
    })
}

fn summary_to_lines(summary: &ExecuteSummary) -> Vec<String> {
    let width =
        summary.outcomes.iter().map(|o| o.name.len()).max().unwrap_or(0);
    let mut lines = summary
        .outcomes
        .iter()
        .map(|outcome| {
            let stage = <&'static str>::from(outcome.stage);
            match &outcome.result {
                Ok(methods) => format!(
                    "{:width$} {stage}, activation {methods:?}",
                    outcome.name
                ),
                Err(err) => format!(
                    "{:width$} Error at {stage}: {:#}",
                    outcome.name,
                    anyhow::Error::new(err.clone())
                ),
            }
        })
        .collect::<Vec<_>>();
    lines.push(format!(
        "activation methods: {:?}",
        summary.activation_methods
    ));
    lines
}
