use clap::{Arg, ArgAction, ArgMatches, Command};
use colored::*;
use indicatif::{ProgressBar, ProgressStyle};
use netsecops::{
    audit::LogAuditSink,
    config::OpsConfig,
    execution::{
        CredentialKind, CredentialStore, ExecutionEvent, JobId, Operation, Protocol, RemoteExecutor, Secret,
    },
    mapping::{HostProfiler, MappingCoordinator, MappingEvent},
    network::{ArpSource, NetworkProber, SystemArpCache},
    output::{self, ExportFormat},
    BatchEvent, DiscoveryCoordinator,
};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;

const DEFAULT_PORTS: &str = "21,22,23,25,53,80,110,135,139,143,443,445,993,995,1433,3306,3389,5432,5900,8080";

/// Descriptor budget; each in-flight probe may hold several sockets
#[cfg(unix)]
fn descriptor_limit() -> u64 {
    use rlimit::Resource;

    match Resource::NOFILE.get() {
        Ok((soft, _)) => soft,
        Err(_) => {
            eprintln!("{}", "[!] WARNING: Could not get file descriptor limit".bright_yellow());
            1024
        }
    }
}

#[cfg(not(unix))]
fn descriptor_limit() -> u64 {
    8192
}

fn clamp_to_descriptors(requested: usize, sockets_per_worker: usize) -> usize {
    let limit = descriptor_limit();
    let per_worker = sockets_per_worker.max(1) as u64;
    // Keep a quarter of the descriptors for everything else
    let cap = ((limit * 3 / 4) / per_worker).max(1);
    let cap = usize::try_from(cap).unwrap_or(usize::MAX);
    if requested > cap {
        println!(
            "{} {} {}",
            "[~] File descriptor limit".bright_blue(),
            limit.to_string().bright_cyan(),
            format!("reduces concurrency to {}", cap).bright_blue()
        );
    }
    requested.min(cap)
}

fn progress_bar(message: &str) -> ProgressBar {
    let pb = ProgressBar::new(100);
    match ProgressStyle::default_bar()
        .template("  {spinner:.cyan} [{bar:30.green/bright_black}] {pos:>3}% {msg}")
    {
        Ok(style) => pb.set_style(style.progress_chars("█▉▊▋▌▍▎▏ ")),
        Err(e) => log::debug!("Progress template rejected: {}", e),
    }
    pb.set_message(message.to_string());
    pb
}

fn build_cli() -> Command {
    let protocol_arg = Arg::new("protocol")
        .short('P')
        .long("protocol")
        .value_name("PROTOCOL")
        .help("ssh, winrm, powershell, wmi, schtasks, smb, scp or custom")
        .default_value("ssh");
    let username_arg = Arg::new("username")
        .short('u')
        .long("username")
        .value_name("USER")
        .help("Username used when no configured credential matches");
    let password_env_arg = Arg::new("password-env")
        .long("password-env")
        .value_name("VAR")
        .help("Environment variable holding the secret for --username")
        .requires("username");
    let key_arg = Arg::new("ssh-key")
        .long("ssh-key")
        .help("Treat the secret as an OpenSSH private key")
        .action(ArgAction::SetTrue);

    Command::new("netsecops")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Network discovery, mapping and remote execution toolkit")
        .subcommand_required(true)
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file (default ~/.netsecops.toml)")
                .value_parser(clap::value_parser!(PathBuf))
                .global(true),
        )
        .arg(
            Arg::new("no-banner")
                .long("no-banner")
                .help("Hide the banner")
                .action(ArgAction::SetTrue)
                .global(true),
        )
        .subcommand(
            Command::new("scan")
                .about("Discover live hosts and open ports")
                .arg(
                    Arg::new("target")
                        .value_name("TARGET")
                        .help("Addresses, ranges (a.b.c.d-e) or CIDR blocks, comma separated")
                        .required(true),
                )
                .arg(
                    Arg::new("ports")
                        .short('p')
                        .long("ports")
                        .value_name("PORTS")
                        .help("Ports to test, e.g. 22,80,8000-8100")
                        .default_value(DEFAULT_PORTS),
                )
                .arg(
                    Arg::new("threads")
                        .short('t')
                        .long("threads")
                        .value_name("N")
                        .help("Concurrent hosts (max 100)")
                        .value_parser(clap::value_parser!(usize)),
                )
                .arg(
                    Arg::new("resolve")
                        .long("resolve")
                        .help("Resolve hostnames in the target list")
                        .action(ArgAction::SetTrue),
                )
                .arg(
                    Arg::new("output")
                        .short('o')
                        .long("output")
                        .value_name("FILE")
                        .help("Write results as JSON")
                        .value_parser(clap::value_parser!(PathBuf)),
                ),
        )
        .subcommand(
            Command::new("map")
                .about("Profile hosts and build the network map")
                .arg(
                    Arg::new("quick")
                        .long("quick")
                        .help("Profile hosts currently in the ARP cache")
                        .action(ArgAction::SetTrue)
                        .conflicts_with("subnet"),
                )
                .arg(
                    Arg::new("subnet")
                        .long("subnet")
                        .value_name("CIDR")
                        .help("Profile every host of this subnet")
                        .required_unless_present("quick"),
                )
                .arg(
                    Arg::new("no-nmap")
                        .long("no-nmap")
                        .help("Use only port heuristics for OS and service detection")
                        .action(ArgAction::SetTrue),
                )
                .arg(
                    Arg::new("output")
                        .short('o')
                        .long("output")
                        .value_name("FILE")
                        .help("Export the map to this file")
                        .value_parser(clap::value_parser!(PathBuf)),
                )
                .arg(
                    Arg::new("format")
                        .short('f')
                        .long("format")
                        .value_name("FORMAT")
                        .help("json, csv or xml (default: from the file extension)"),
                ),
        )
        .subcommand(Command::new("arp").about("Show the ARP cache with vendors"))
        .subcommand(
            Command::new("exec")
                .about("Run a command on remote hosts")
                .arg(Arg::new("target").value_name("TARGET").required(true))
                .arg(Arg::new("command").value_name("COMMAND").required(true))
                .arg(protocol_arg.clone())
                .arg(username_arg.clone())
                .arg(password_env_arg.clone())
                .arg(key_arg.clone()),
        )
        .subcommand(
            Command::new("deploy")
                .about("Copy a local file to remote hosts")
                .arg(Arg::new("target").value_name("TARGET").required(true))
                .arg(Arg::new("source").value_name("LOCAL").required(true))
                .arg(Arg::new("destination").value_name("REMOTE").required(true))
                .arg(protocol_arg.clone().default_value("scp"))
                .arg(username_arg.clone())
                .arg(password_env_arg.clone())
                .arg(key_arg.clone()),
        )
        .subcommand(
            Command::new("retrieve")
                .about("Copy a remote file from remote hosts")
                .arg(Arg::new("target").value_name("TARGET").required(true))
                .arg(Arg::new("source").value_name("REMOTE").required(true))
                .arg(Arg::new("destination").value_name("LOCAL").required(true))
                .arg(protocol_arg.default_value("scp"))
                .arg(username_arg)
                .arg(password_env_arg)
                .arg(key_arg),
        )
}

fn print_banner() {
    println!("{}", "NetSecOps".truecolor(52, 152, 219).bold());
    println!("{}", "discover · map · execute".bright_blue());
    println!();
}

fn load_config(matches: &ArgMatches) -> anyhow::Result<OpsConfig> {
    match matches.get_one::<PathBuf>("config") {
        Some(path) => Ok(OpsConfig::from_toml_file(path)?),
        None => Ok(OpsConfig::load_default_config()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let matches = build_cli().get_matches();
    if !matches.get_flag("no-banner") {
        print_banner();
    }
    let config = load_config(&matches)?;

    match matches.subcommand() {
        Some(("scan", sub)) => run_scan(sub, config).await,
        Some(("map", sub)) => run_map(sub, config).await,
        Some(("arp", _)) => run_arp(config).await,
        Some(("exec", sub)) => {
            let operation = Operation::RunCommand {
                command: required(sub, "command")?,
            };
            run_execution(sub, config, operation).await
        }
        Some(("deploy", sub)) => {
            let operation = Operation::DeployFile {
                source: required(sub, "source")?,
                destination: required(sub, "destination")?,
            };
            run_execution(sub, config, operation).await
        }
        Some(("retrieve", sub)) => {
            let operation = Operation::RetrieveFile {
                source: required(sub, "source")?,
                destination: required(sub, "destination")?,
            };
            run_execution(sub, config, operation).await
        }
        _ => Ok(()),
    }
}

fn required(matches: &ArgMatches, name: &str) -> anyhow::Result<String> {
    matches
        .get_one::<String>(name)
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("missing argument: {}", name))
}

async fn run_scan(matches: &ArgMatches, config: OpsConfig) -> anyhow::Result<()> {
    let target = required(matches, "target")?;
    let ports = required(matches, "ports")?;
    let discovery = config.discovery;

    let requested = matches
        .get_one::<usize>("threads")
        .copied()
        .unwrap_or(discovery.default_concurrency);
    let concurrency = clamp_to_descriptors(requested, discovery.port_parallelism);

    let prober = Arc::new(NetworkProber::new(&discovery));
    let parser = netsecops::utils::TargetParser::default()
        .with_hostname_resolution(matches.get_flag("resolve"));
    let coordinator = DiscoveryCoordinator::new(prober, discovery, Arc::new(LogAuditSink))
        .with_target_parser(parser);
    let mut events = coordinator.subscribe();

    if !coordinator.start(&target, &ports, concurrency).await? {
        anyhow::bail!("a discovery batch is already running");
    }

    let pb = progress_bar("probing");
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                pb.println(format!("{}", "[!] Interrupted, stopping scan".bright_yellow()));
                coordinator.stop().await;
            }
            event = events.recv() => match event {
                Ok(BatchEvent::Started { total, .. }) => {
                    pb.set_message(format!("probing {} hosts", total));
                }
                Ok(BatchEvent::Item(host)) => {
                    if host.is_online {
                        let ports = host
                            .open_ports
                            .iter()
                            .map(|p| p.to_string())
                            .collect::<Vec<_>>()
                            .join(",");
                        pb.println(format!(
                            "{} {:<15} {:<30} {}",
                            "[+]".bright_green(),
                            host.address.to_string().bright_cyan(),
                            host.display_name(),
                            ports.bright_white()
                        ));
                    }
                }
                Ok(BatchEvent::Progress { percent, .. }) => pb.set_position(u64::from(percent)),
                Ok(BatchEvent::Completed(_)) => break,
                Err(RecvError::Lagged(skipped)) => {
                    log::warn!("Missed {} discovery events", skipped);
                    if !coordinator.is_active().await {
                        break;
                    }
                }
                Err(RecvError::Closed) => break,
            },
        }
    }
    pb.finish_and_clear();

    let report = coordinator
        .wait()
        .await
        .ok_or_else(|| anyhow::anyhow!("discovery batch ended without a report"))?;
    let summary = &report.summary;
    println!(
        "{} {}/{} hosts probed, {} online, {} open ports in {:.2?}{}",
        "[~]".bright_blue(),
        summary.completed,
        summary.total,
        summary.hosts_online.to_string().bright_green(),
        summary.open_ports,
        summary.duration,
        if summary.stopped { " (stopped)" } else { "" }
    );

    if let Some(path) = matches.get_one::<PathBuf>("output") {
        let mut hosts = report.results;
        hosts.retain(|h| h.is_online);
        output::write_atomic(path, &serde_json::to_string_pretty(&hosts)?)?;
        println!("{} Results written to {}", "[✓]".bright_green(), path.display());
    }
    Ok(())
}

async fn run_map(matches: &ArgMatches, mut config: OpsConfig) -> anyhow::Result<()> {
    if matches.get_flag("no-nmap") {
        config.mapping = config.mapping.with_nmap(false);
    }
    let export = match matches.get_one::<PathBuf>("output") {
        Some(path) => Some((path.clone(), export_format(matches, path)?)),
        None => None,
    };

    let profiler = Arc::new(HostProfiler::from_config(&config.discovery, &config.mapping));
    let coordinator = MappingCoordinator::new(
        profiler,
        Arc::new(SystemArpCache),
        config.mapping,
        Arc::new(LogAuditSink),
    );
    let mut events = coordinator.subscribe();

    let started = match matches.get_one::<String>("subnet") {
        Some(subnet) => coordinator.start_full_mapping(subnet).await?,
        None => coordinator.start_quick_mapping().await?,
    };
    if !started {
        anyhow::bail!("a mapping batch is already running");
    }

    let pb = progress_bar("profiling");
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                pb.println(format!("{}", "[!] Interrupted, stopping mapping".bright_yellow()));
                coordinator.stop().await;
            }
            event = events.recv() => match event {
                Ok(MappingEvent::Started { total, mode, .. }) => {
                    pb.set_message(format!("{} mapping of {} hosts", mode, total));
                }
                Ok(MappingEvent::ArpTableUpdated(entries)) => {
                    pb.println(format!("{} {} ARP entries", "[~]".bright_blue(), entries.len()));
                }
                Ok(MappingEvent::HostProfiled(profile)) => {
                    pb.println(format!(
                        "{} {:<15} {:<12} {:<22} {}",
                        "[+]".bright_green(),
                        profile.host.address.to_string().bright_cyan(),
                        profile.device_type.to_string().bright_magenta(),
                        profile.os_guess,
                        profile.vendor.bright_white()
                    ));
                }
                Ok(MappingEvent::Progress { percent, .. }) => pb.set_position(u64::from(percent)),
                Ok(MappingEvent::TopologyBuilt(nodes)) => {
                    pb.finish_and_clear();
                    for node in nodes {
                        println!("{}", node);
                    }
                }
                Ok(MappingEvent::Completed(_)) => break,
                Err(RecvError::Lagged(skipped)) => {
                    log::warn!("Missed {} mapping events", skipped);
                    if !coordinator.is_active().await {
                        break;
                    }
                }
                Err(RecvError::Closed) => break,
            },
        }
    }
    pb.finish_and_clear();

    let report = coordinator
        .wait()
        .await
        .ok_or_else(|| anyhow::anyhow!("mapping batch ended without a report"))?;
    let summary = &report.summary;
    println!(
        "{} {} hosts profiled out of {} in {:.2?}{}",
        "[~]".bright_blue(),
        summary.hosts_online.to_string().bright_green(),
        summary.total,
        summary.duration,
        if summary.stopped { " (stopped)" } else { "" }
    );

    if let Some((path, format)) = export {
        coordinator.export(format, &path).await?;
        println!("{} Map exported to {}", "[✓]".bright_green(), path.display());
    }
    Ok(())
}

fn export_format(matches: &ArgMatches, path: &Path) -> anyhow::Result<ExportFormat> {
    match matches.get_one::<String>("format") {
        Some(name) => Ok(name.parse::<ExportFormat>()?),
        None => Ok(ExportFormat::from_path(path).unwrap_or(ExportFormat::Json)),
    }
}

async fn run_arp(config: OpsConfig) -> anyhow::Result<()> {
    let vendors = netsecops::intelligence::VendorDatabase::load_or_builtin(
        config.mapping.vendor_csv.as_deref(),
    );
    let entries = SystemArpCache.snapshot().await;
    if entries.is_empty() {
        println!("{}", "[!] ARP cache is empty".bright_yellow());
        return Ok(());
    }
    for entry in entries {
        println!(
            "{:<15} {} {:<8} {}",
            entry.ip.to_string().bright_cyan(),
            entry.mac,
            entry.entry_type,
            vendors.lookup(&entry.mac).bright_white()
        );
    }
    Ok(())
}

fn credential_store(matches: &ArgMatches, config: &OpsConfig) -> anyhow::Result<CredentialStore> {
    let store = CredentialStore::from_entries(&config.credentials);
    if let Some(username) = matches.get_one::<String>("username") {
        let secret = match matches.get_one::<String>("password-env") {
            Some(var) => std::env::var(var)
                .map_err(|_| anyhow::anyhow!("environment variable {} is not set", var))?,
            None => String::new(),
        };
        let kind = if matches.get_flag("ssh-key") {
            CredentialKind::SshKey
        } else {
            CredentialKind::Password
        };
        store.add("command-line", "*", username, Secret::new(secret), kind);
    }
    Ok(store)
}

async fn run_execution(matches: &ArgMatches, config: OpsConfig, operation: Operation) -> anyhow::Result<()> {
    let target = required(matches, "target")?;
    let protocol: Protocol = required(matches, "protocol")?.parse()?;
    let store = credential_store(matches, &config)?;

    let executor = RemoteExecutor::new(Arc::new(store), config.execution, Arc::new(LogAuditSink));
    let mut events = executor.subscribe();
    let ids = executor.submit(&target, operation, protocol).await?;
    println!(
        "{} {} jobs submitted via {} (up to {} at once)",
        "[~]".bright_blue(),
        ids.len(),
        protocol,
        executor.concurrency_limit()
    );

    let mut pending: HashSet<_> = ids.into_iter().collect();
    let (mut succeeded, mut failed, mut unknown) = (0usize, 0usize, 0usize);
    while !pending.is_empty() {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("{}", "[!] Interrupted, stopping jobs".bright_yellow());
                for job in executor.active_jobs().await {
                    if let Err(e) = executor.stop(job.id).await {
                        log::debug!("{}", e);
                    }
                }
            }
            event = events.recv() => {
                let event = match event {
                    Ok(event) => event,
                    Err(RecvError::Lagged(skipped)) => {
                        log::warn!("Missed {} execution events", skipped);
                        let reaped = reap_finished(&executor, &mut pending).await;
                        if !reaped.is_empty() {
                            println!(
                                "{} jobs {:?} finished while their events were missed",
                                "[!]".bright_yellow(),
                                reaped
                            );
                            unknown += reaped.len();
                        }
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };
                if !pending.contains(&event.job_id()) {
                    continue;
                }
                match event {
                    ExecutionEvent::CredentialRequired { job_id, host, protocol } => {
                        println!(
                            "{} No {} credential for {}; use --username/--password-env",
                            "[!]".bright_yellow(),
                            protocol,
                            host.to_string().bright_cyan()
                        );
                        executor.stop(job_id).await?;
                    }
                    ExecutionEvent::JobStarted { job_id, target, .. } => {
                        println!("{} job {} started on {}", "[~]".bright_blue(), job_id, target.to_string().bright_cyan());
                    }
                    ExecutionEvent::OutputChunk { job_id, chunk } => {
                        println!("{} {}", format!("[{}]", job_id).bright_black(), chunk);
                    }
                    ExecutionEvent::JobProgress { .. } => {}
                    ExecutionEvent::JobCompleted { job_id, .. } => {
                        succeeded += 1;
                        pending.remove(&job_id);
                        println!("{} job {} completed", "[✓]".bright_green(), job_id);
                    }
                    ExecutionEvent::JobFailed { job_id, error } => {
                        failed += 1;
                        pending.remove(&job_id);
                        println!("{} job {} failed: {}", "[✗]".bright_red(), job_id, error);
                    }
                    ExecutionEvent::JobStopped { job_id } => {
                        failed += 1;
                        pending.remove(&job_id);
                        println!("{} job {} stopped", "[!]".bright_yellow(), job_id);
                    }
                }
            }
        }
    }

    println!(
        "{} {} succeeded, {} did not, {} unknown",
        "[~]".bright_blue(),
        succeeded.to_string().bright_green(),
        failed.to_string().bright_red(),
        unknown
    );
    if failed + unknown > 0 {
        std::process::exit(1);
    }
    Ok(())
}

/// Drop pending jobs the executor no longer tracks; their terminal event
/// was lost to lag. Returns the dropped ids in ascending order.
async fn reap_finished(executor: &RemoteExecutor, pending: &mut HashSet<JobId>) -> Vec<JobId> {
    let mut finished = Vec::new();
    for &job_id in pending.iter() {
        if executor.job(job_id).await.is_none() {
            finished.push(job_id);
        }
    }
    for job_id in &finished {
        pending.remove(job_id);
    }
    finished.sort_unstable();
    finished
}

#[cfg(test)]
mod tests {
    use super::*;
    use netsecops::{audit::NullAuditSink, config::ExecutionConfig};

    #[tokio::test]
    async fn test_reap_finished_drops_only_untracked_jobs() {
        let executor = RemoteExecutor::new(
            Arc::new(CredentialStore::new()),
            ExecutionConfig::default(),
            Arc::new(NullAuditSink),
        );
        let operation = Operation::RunCommand {
            command: "uptime".to_string(),
        };
        let ids = executor
            .submit("10.0.0.1-3", operation, Protocol::Ssh)
            .await
            .unwrap();
        executor.stop(ids[0]).await.unwrap();
        executor.stop(ids[2]).await.unwrap();

        let mut pending: HashSet<JobId> = ids.iter().copied().collect();
        assert_eq!(reap_finished(&executor, &mut pending).await, vec![ids[0], ids[2]]);
        assert_eq!(pending, HashSet::from([ids[1]]));

        assert!(reap_finished(&executor, &mut pending).await.is_empty());
        executor.stop(ids[1]).await.unwrap();
    }
}
