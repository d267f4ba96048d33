//! procroute: edit the persisted per-process routing policy.

use clap::{Parser, Subcommand};
use procroute::converter::{self, ImportPlan, DEFAULT_PROXY_URL};
use procroute::{ConfigStore, MemoryGateway, Policy, RuleAction};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "procroute")]
#[command(version = "0.1.0")]
#[command(about = "Manage per-process proxy routing rules", long_about = None)]
struct Cli {
    /// Config file (defaults to the platform config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log verbosity: 0 info, 1 debug, 2-3 trace
    #[arg(short, long, global = true, default_value_t = 0, value_parser = clap::value_parser!(u8).range(0..=3))]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print settings, proxy configs and rules
    Show,

    /// Append rules
    Add {
        /// Rule as process:hosts:ports:protocol:action (repeatable)
        #[arg(short, long)]
        rule: Vec<String>,

        /// JSON rule file
        #[arg(long)]
        rule_file: Option<PathBuf>,

        /// Proxy for PROXY rules: type://host:port[:username:password]
        #[arg(short, long, default_value = DEFAULT_PROXY_URL)]
        proxy: String,
    },

    /// Delete rules by id
    Delete {
        #[arg(required = true)]
        ids: Vec<u32>,
    },

    /// Move a rule to a 1-based position
    Move { id: u32, position: u32 },

    /// Enable a rule
    Enable { id: u32 },

    /// Disable a rule
    Disable { id: u32 },

    /// Delete a proxy config and every rule routed through it
    DeleteProxy {
        id: u32,

        /// Confirm deleting referencing rules
        #[arg(short, long)]
        yes: bool,
    },

    /// Check that a proxy config can reach a target
    TestProxy {
        id: u32,

        /// Target host
        #[arg(long, default_value = "google.com")]
        host: String,

        /// Target port
        #[arg(long, default_value_t = 80)]
        port: u16,
    },

    /// Write rules as a JSON rule file
    Export { file: PathBuf },

    /// Change global settings
    Set {
        #[arg(long)]
        dns_via_proxy: Option<bool>,

        #[arg(long)]
        localhost_via_proxy: Option<bool>,

        #[arg(long)]
        traffic_logging: Option<bool>,
    },
}

fn main() {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter)).init();

    if let Err(e) = run(cli) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> procroute::Result<()> {
    let store = match cli.config {
        Some(path) => ConfigStore::new(path),
        None => ConfigStore::open_default()?,
    };

    let snapshot = store.load();
    let mut policy = Policy::new(MemoryGateway::new());
    let report = policy.restore(&snapshot);
    if !report.dropped_rules.is_empty() {
        println!("Dropped {} unreplayable rule(s)", report.dropped_rules.len());
    }
    let mut policy = policy.with_store(store);

    match cli.command {
        Commands::Show => show(&policy),
        Commands::Add {
            rule,
            rule_file,
            proxy,
        } => {
            let mut plan = match rule_file {
                Some(path) => converter::parse_rule_file(path)?,
                None => ImportPlan::default(),
            };
            for line in &rule {
                plan.drafts.push(converter::parse_rule_line(line)?);
            }
            if plan.is_empty() {
                println!("No rules given; use --rule or --rule-file");
                return Ok(());
            }

            let proxy_id = if plan.drafts.iter().any(|d| d.action == RuleAction::Proxy) {
                let config = converter::parse_proxy_url(&proxy)?;
                let id = policy.ensure_proxy_config(config)?;
                println!("Using proxy config {}: {}", id, proxy);
                Some(id)
            } else {
                None
            };

            let report = policy.import_rules(&plan, proxy_id)?;
            for name in &report.skipped {
                println!("  Skipping disabled rule: {}", name);
            }
            for (name, reason) in &report.failed {
                println!("  Failed to add rule for {}: {}", name, reason);
            }
            for id in &report.added {
                if let Some(rule) = policy.rule(*id) {
                    println!("  Added rule {}: {}", id, rule.definition);
                }
            }
        }
        Commands::Delete { ids } => {
            let removed = policy.delete_rules(&ids);
            println!("Deleted {} of {} rule(s)", removed, ids.len());
        }
        Commands::Move { id, position } => {
            if policy.move_rule(id, position)? {
                println!("Moved rule {} to position {}", id, position);
            } else {
                println!("Rule {} is already at position {}", id, position);
            }
        }
        Commands::Enable { id } => toggle(&mut policy, id, true)?,
        Commands::Disable { id } => toggle(&mut policy, id, false)?,
        Commands::DeleteProxy { id, yes } => {
            let count = policy.rules_referencing_config(id);
            if count > 0 && !yes {
                println!(
                    "Proxy config {} is used by {} rule(s); rerun with --yes to delete them too",
                    id, count
                );
                return Ok(());
            }
            match policy.delete_proxy_config(id)? {
                Some(removed) => println!("Deleted proxy config {} and {} rule(s)", id, removed),
                None => println!("Proxy config {} not found", id),
            }
        }
        Commands::TestProxy { id, host, port } => {
            let report = policy.test_proxy_config(id, &host, port)?;
            println!("{}", report);
        }
        Commands::Export { file } => {
            policy.export_rules(&file)?;
            println!("Exported {} rule(s) to {}", policy.rules().len(), file.display());
        }
        Commands::Set {
            dns_via_proxy,
            localhost_via_proxy,
            traffic_logging,
        } => {
            if let Some(v) = dns_via_proxy {
                policy.set_dns_via_proxy(v);
            }
            if let Some(v) = localhost_via_proxy {
                policy.set_localhost_via_proxy(v);
            }
            if let Some(v) = traffic_logging {
                policy.set_traffic_logging(v);
            }
            show_settings(&policy);
        }
    }

    Ok(())
}

fn toggle(policy: &mut Policy<MemoryGateway>, id: u32, enabled: bool) -> procroute::Result<()> {
    let state = if enabled { "enabled" } else { "disabled" };
    if policy.set_rule_enabled(id, enabled)? {
        println!("Rule {} {}", id, state);
    } else if policy.rule(id).is_some() {
        println!("Rule {} already {}", id, state);
    } else {
        println!("Rule {} not found", id);
    }
    Ok(())
}

fn on_off(v: bool) -> &'static str {
    if v {
        "on"
    } else {
        "off"
    }
}

fn show_settings(policy: &Policy<MemoryGateway>) {
    let s = policy.settings();
    println!("Settings:");
    println!("  DNS via proxy:       {}", on_off(s.dns_via_proxy));
    println!("  Localhost via proxy: {}", on_off(s.localhost_via_proxy));
    println!("  Traffic logging:     {}", on_off(s.traffic_logging_enabled));
}

fn show(policy: &Policy<MemoryGateway>) {
    show_settings(policy);
    if policy.snapshot().is_empty() {
        println!("\nNo proxy configs or rules; add some with `procroute add`");
        return;
    }

    println!("\nProxy configs:");
    if policy.proxy_configs().is_empty() {
        println!("  (none)");
    }
    for config in policy.proxy_configs() {
        println!(
            "  [{}] {} ({} rule(s))",
            config.id,
            config,
            policy.rules_referencing_config(config.id)
        );
    }

    println!("\nRules:");
    if policy.rules().is_empty() {
        println!("  (none)");
    }
    for rule in policy.rules() {
        let via = policy
            .proxy_config(rule.definition.proxy_config_id)
            .filter(|_| rule.definition.action.uses_proxy())
            .map(|c| format!(" via {}", c.display_name()))
            .unwrap_or_default();
        let disabled = if rule.enabled { "" } else { " [disabled]" };
        println!(
            "  {:>3}. #{} {}{}{}",
            rule.position, rule.id, rule.definition, via, disabled
        );
    }
}
