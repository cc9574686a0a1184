use std::path::Path;
use std::sync::Arc;
use std::{fs, process};

use clap::Parser;
use clusterset_cli::{App, CliError, Command, LabCommand, Servers};
use clusterset_core::context::StdoutConsole;
use clusterset_core::topology::status::{ClusterRole, ClusterSetStatus};
use clusterset_core::topology;
use clusterset_core::{OperationContext, Settings};
use clusterset_sim::{Lab, LabSpec};
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let app = App::parse();
    if let Err(err) = run(&app) {
        eprintln!("ERROR: {err}");
        process::exit(1);
    }
}

fn run(app: &App) -> Result<(), CliError> {
    match &app.command {
        Command::Lab(command) => return lab(app, command),
        Command::Schema => {
            let schema = schemars::schema_for!(Settings);
            println!("{}", serde_json::to_string_pretty(&schema)?);
            return Ok(());
        }
        _ => {}
    }

    let lab = Lab::load(&app.lab)?;
    let ctx = OperationContext::builder()
        .console(Arc::new(StdoutConsole))
        .connector(lab.connector())
        .settings(settings(app.settings.as_deref())?)
        .build();
    // Save whatever the operation left behind, failed or not.
    let outcome = operate(&ctx, &app.command);
    lab.save(&app.lab)?;
    outcome
}

fn settings(path: Option<&Path>) -> Result<Settings, CliError> {
    match path {
        Some(path) => Ok(serde_json::from_str(&fs::read_to_string(path)?)?),
        None => Ok(Settings::default()),
    }
}

fn operate(ctx: &OperationContext, command: &Command) -> Result<(), CliError> {
    match command {
        Command::Create(args) => {
            topology::create_cluster_set(ctx, &args.target.instance, &args.domain, &args.into())?;
        }
        Command::CreateReplica(args) => {
            topology::create_replica_cluster(ctx, &args.target.instance, &args.new_instance, &args.name, &args.into())?;
        }
        Command::SetPrimary(args) => {
            topology::set_primary_cluster(ctx, &args.target.instance, &args.cluster, &args.into())?;
        }
        Command::ForcePrimary(args) => {
            topology::force_primary_cluster(ctx, &args.target.instance, &args.cluster, &args.into())?;
        }
        Command::Remove(args) => topology::remove_cluster(ctx, &args.target.instance, &args.cluster, &args.into())?,
        Command::Rejoin(args) => topology::rejoin_cluster(ctx, &args.target.instance, &args.cluster, &args.into())?,
        Command::Dissolve(args) => topology::dissolve(ctx, &args.target.instance, &args.into())?,
        Command::Status(args) => {
            let status = topology::status(ctx, &args.target.instance)?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                print_status(&status);
            }
        }
        Command::Describe(target) => {
            let description = topology::describe(ctx, &target.instance)?;
            println!("{}", serde_json::to_string_pretty(&description)?);
        }
        Command::Routers(target) => {
            let routers = topology::list_routers(ctx, &target.instance)?;
            println!("{}", serde_json::to_string_pretty(&routers)?);
        }
        Command::SetRoutingOption(args) => topology::set_routing_option(
            ctx,
            &args.target.instance,
            args.router.as_deref(),
            &args.option,
            args.value.as_deref(),
        )?,
        Command::Lab(_) | Command::Schema => {}
    }
    Ok(())
}

fn print_status(status: &ClusterSetStatus) {
    println!("ClusterSet '{}': {}", status.domain_name, status.status);
    println!(
        "  global primary: {}",
        status.global_primary_instance.as_deref().unwrap_or("<none>")
    );
    for cluster in &status.clusters {
        let role = match cluster.role {
            ClusterRole::Primary => "PRIMARY",
            ClusterRole::Replica => "REPLICA",
        };
        println!(
            "  {:<16} {role:<8} {:<20} {}",
            cluster.name,
            cluster.global_status.as_str(),
            cluster.availability.as_str()
        );
        if let Some(errant) = &cluster.errant {
            println!("    errant: {errant}");
        }
    }
}

fn lab(app: &App, command: &LabCommand) -> Result<(), CliError> {
    let lab = match command {
        LabCommand::New(args) => {
            if app.lab.exists() && !args.force {
                return Err(CliError::Usage(format!(
                    "{} already exists, pass --force to replace it",
                    app.lab.display()
                )));
            }
            let lab = Lab::new(&LabSpec::from(args))?;
            lab.save(&app.lab)?;
            println!("Lab written to {}", app.lab.display());
            return show(&lab, false);
        }
        _ => Lab::load(&app.lab)?,
    };
    match command {
        LabCommand::New(_) => {}
        LabCommand::Show(args) => return show(&lab, args.json),
        LabCommand::Partition(servers) => {
            for address in addresses(&lab, servers)? {
                lab.partition(&address);
            }
        }
        LabCommand::Heal(servers) => {
            for address in addresses(&lab, servers)? {
                lab.heal(&address);
            }
        }
        LabCommand::Write(args) => {
            let gtid = if args.errant {
                lab.write_errant(&args.address, &args.table)?
            } else {
                lab.write(&args.address, &args.table)?
            };
            println!("{gtid}");
        }
        LabCommand::StopChannel(server) => lab.stop_channel(&server.address),
        LabCommand::Purge(server) => lab.purge(&server.address),
    }
    lab.save(&app.lab)?;
    Ok(())
}

fn addresses(lab: &Lab, servers: &Servers) -> Result<Vec<String>, CliError> {
    if !servers.cluster {
        return Ok(servers.targets.clone());
    }
    let mut addresses = Vec::new();
    for name in &servers.targets {
        let members = lab.addresses_of(name);
        if members.is_empty() {
            return Err(CliError::Usage(format!("no cluster named '{name}' in the lab")));
        }
        addresses.extend(members);
    }
    Ok(addresses)
}

fn show(lab: &Lab, json: bool) -> Result<(), CliError> {
    let overview = lab.overview();
    if json {
        println!("{}", serde_json::to_string_pretty(&overview)?);
        return Ok(());
    }
    for server in overview {
        println!(
            "{:<20} {:<12} group={:<38} primary={:<5} sro={:<5} source={:<20} gtids={}",
            server.address,
            if server.reachable { "reachable" } else { "PARTITIONED" },
            server.group.as_deref().unwrap_or("-"),
            server.primary,
            server.super_read_only,
            server.channel_source.as_deref().unwrap_or("-"),
            server.gtid_executed,
        );
    }
    Ok(())
}
