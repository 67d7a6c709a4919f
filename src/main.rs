use clap::{Arg, ArgAction, ArgMatches, Command};
use std::convert::TryFrom;
use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, warn};

use zyn::config::Config;
use zyn::connection::Connection;
use zyn::filesystem::LocalFilesystem;
use zyn::live_edit::TokioSleeper;
use zyn::logging::init_tracing;
use zyn::protocol::{CountersResponse, RemoteChild, SystemResponse};
use zyn::state::{ClientState, StateManager};
use zyn::sync::{SyncAction, ZynClient};
use zyn::transport::connect_tcp;
use zyn::types::FileType;
use zyn::utils::{setup_signal_handlers, ShutdownFlag};
use zyn::validation::Validator;

///////////////////////
// Utility functions //
///////////////////////

fn build_config(matches: &ArgMatches) -> Result<Config, Box<dyn Error>> {
	let state_dir = PathBuf::from(
		matches.get_one::<String>("state-dir").map(|s| s.as_str()).unwrap_or(".zyn"),
	);
	let config_path = matches.get_one::<String>("config").map(PathBuf::from);
	let mut config = Config::load(config_path.as_deref(), &state_dir)?;
	config.state_dir = state_dir;

	if let Some(address) = matches.get_one::<String>("address") {
		config.address = address.clone();
	}
	if let Some(port) = matches.get_one::<u16>("port") {
		config.port = *port;
	}
	if let Some(username) = matches.get_one::<String>("username") {
		config.username = username.clone();
	}
	if let Some(data_dir) = matches.get_one::<String>("data-dir") {
		config.data_dir = PathBuf::from(data_dir);
	}
	if matches.get_flag("debug-protocol") {
		config.debug_protocol = true;
	}
	config.validate()?;
	Ok(config)
}

async fn connect(config: &Config, address: &str, port: u16, username: &str) -> Result<Connection, Box<dyn Error>> {
	let password = config.password.as_deref().ok_or("password required: set ZYN_PASSWORD")?;
	let mut connection =
		Connection::new(Arc::new(connect_tcp(address, port).await?)).with_timeouts(config.timeouts());
	if config.debug_protocol {
		connection.enable_debug_messages();
	}
	connection.authenticate(username, password).await?.check("authenticate")?;
	if config.heartbeat {
		connection.start_heartbeat();
	}
	info!("Connected to {}:{} as {}", address, port, username);
	Ok(connection)
}

async fn init(config: &Config) -> Result<(), Box<dyn Error>> {
	let manager = StateManager::new(&config.state_dir);
	let _lock = manager.lock().await?;
	if manager.exists() {
		return Err(format!("already initialized: {}", manager.state_path().display()).into());
	}
	tokio::fs::create_dir_all(&config.data_dir).await?;
	let data_dir = tokio::fs::canonicalize(&config.data_dir).await?;
	let connection = connect(config, &config.address, config.port, &config.username).await?;
	let state = ClientState::new(
		config.username.clone(),
		config.address.clone(),
		config.port,
		LocalFilesystem::new(data_dir),
	);
	let mut client = ZynClient::new(connection, state);
	let identity = client.update_remote_info().await?;
	manager.save(client.state()).await?;
	println!("Initialized, server id {}", identity.server_id);
	client.connection().disconnect().await?;
	Ok(())
}

fn print_actions(client_actions: &[(String, SyncAction)]) {
	for (path, action) in client_actions {
		match action {
			SyncAction::UpToDate => {}
			SyncAction::Fetched { revision } => println!("fetched  {} (revision {})", path, revision),
			SyncAction::Pushed { revision } => println!("pushed   {} (revision {})", path, revision),
			SyncAction::Untracked => println!("removed  {} (deleted on server)", path),
		}
	}
}

async fn run(client: &mut ZynClient, command: &str, sub: &ArgMatches, config: &Config) -> Result<(), Box<dyn Error>> {
	let path = || sub.get_one::<String>("path").map(|s| s.as_str()).unwrap_or("/");
	match command {
		"add" => {
			let file_type = if sub.get_flag("random-access") {
				Some(FileType::RandomAccess)
			} else if sub.get_flag("blob") {
				Some(FileType::Blob)
			} else {
				None
			};
			let element = client.add(path(), file_type).await?;
			println!("added    {} (node {})", element.path, element.node_id);
		}
		"fetch" => {
			for fetched in client.fetch(path(), sub.get_flag("overwrite")).await? {
				println!("fetched  {}", fetched);
			}
		}
		"sync" => {
			let report = client.sync(path(), sub.get_flag("discard-local")).await?;
			print_actions(&report.actions);
			for (path, error) in &report.failures {
				eprintln!("failed   {}: {}", path, error);
			}
			if report.is_up_to_date() {
				println!("Up to date");
			}
		}
		"remove" => {
			client.remove(path(), sub.get_flag("delete-local"), sub.get_flag("delete-remote")).await?;
			println!("removed  {}", path());
		}
		"ls" => {
			let (_, children) = client.query_directory(path()).await?;
			for child in children {
				let marker = if child.is_tracked() { "T" } else { "-" };
				match &child.remote {
					RemoteChild::File { name, revision, size, file_type, .. } => {
						println!("{} {:>10} {:>6} {:<13} {}", marker, size, revision, file_type, name)
					}
					RemoteChild::Directory { name, .. } => {
						println!("{} {:>10} {:>6} {:<13} {}/", marker, "", "", "directory", name)
					}
				}
			}
		}
		"untracked" => {
			for element in client.untracked_children(path()).await? {
				let suffix = if element.is_directory { "/" } else { "" };
				println!("{}{}", element.path, suffix);
			}
		}
		"open" => {
			let paths: Vec<&str> = sub
				.get_many::<String>("paths")
				.ok_or("open: at least one path required")?
				.map(|s| s.as_str())
				.collect();
			let mut options = config.live_edit_options();
			options.max_iterations = sub.get_one::<u64>("iterations").copied();
			let shutdown = ShutdownFlag::new();
			setup_signal_handlers(shutdown.clone());
			let summary = client.open(&paths, &options, &TokioSleeper, &shutdown).await?;
			println!(
				"Closed after {} iterations, {} remote changes applied, {} local changes pushed",
				summary.iterations, summary.notifications_applied, summary.pushes
			);
		}
		"system" => {
			let rsp = client.connection().query_system().await?;
			rsp.check("query system")?;
			let system = SystemResponse::try_from(&rsp)?;
			println!("server id:        {}", system.server_id);
			println!("started at:       {}", system.started_at);
			println!("open files:       {}", system.number_of_open_files);
			println!("max open files:   {}", system.max_open_files_per_connection);
			if let Some(is_admin) = system.is_admin {
				println!("admin:            {}", is_admin);
			}
		}
		"counters" => {
			let rsp = client.connection().query_counters().await?;
			rsp.check("query counters")?;
			let counters = CountersResponse::try_from(&rsp)?;
			println!("active connections: {}", counters.active_connections);
			println!("files:              {}", counters.number_of_files);
			println!("open files:         {}", counters.number_of_open_files);
		}
		other => return Err(format!("unknown command: {}", other).into()),
	}
	Ok(())
}

fn path_arg() -> Arg {
	Arg::new("path").help("Remote path").default_value("/")
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
	let matches = Command::new("zyn")
		.version("0.1.0")
		.about("Client for the Zyn file synchronization server")
		.subcommand_required(true)
		.arg(Arg::new("config").short('c').long("config").value_name("FILE").help("Configuration file"))
		.arg(
			Arg::new("state-dir")
				.short('s')
				.long("state-dir")
				.value_name("DIR")
				.help("Client state directory"),
		)
		.arg(Arg::new("data-dir").short('d').long("data-dir").value_name("DIR").help("Local data directory"))
		.arg(Arg::new("address").short('a').long("address").value_name("HOST"))
		.arg(
			Arg::new("port")
				.short('p')
				.long("port")
				.value_name("PORT")
				.value_parser(clap::value_parser!(u16)),
		)
		.arg(Arg::new("username").short('u').long("username").value_name("USER"))
		.arg(
			Arg::new("accept-new-server")
				.long("accept-new-server")
				.action(ArgAction::SetTrue)
				.help("Synchronize with a server instance not seen before"),
		)
		.arg(Arg::new("debug-protocol").long("debug-protocol").action(ArgAction::SetTrue))
		.arg(Arg::new("verbose").short('v').long("verbose").action(ArgAction::SetTrue))
		.subcommand(Command::new("init").about("Create client state and bind it to the server"))
		.subcommand(
			Command::new("add")
				.about("Track a local file or directory and create it on the server")
				.arg(Arg::new("path").required(true))
				.arg(Arg::new("random-access").long("random-access").action(ArgAction::SetTrue))
				.arg(
					Arg::new("blob")
						.long("blob")
						.action(ArgAction::SetTrue)
						.conflicts_with("random-access"),
				),
		)
		.subcommand(
			Command::new("fetch")
				.about("Download a remote element and track it")
				.arg(path_arg())
				.arg(Arg::new("overwrite").long("overwrite").action(ArgAction::SetTrue)),
		)
		.subcommand(
			Command::new("sync")
				.about("Synchronize tracked elements")
				.arg(path_arg())
				.arg(Arg::new("discard-local").long("discard-local").action(ArgAction::SetTrue)),
		)
		.subcommand(
			Command::new("remove")
				.about("Stop tracking an element")
				.arg(Arg::new("path").required(true))
				.arg(Arg::new("delete-local").long("delete-local").action(ArgAction::SetTrue))
				.arg(Arg::new("delete-remote").long("delete-remote").action(ArgAction::SetTrue)),
		)
		.subcommand(Command::new("ls").about("List a remote directory").arg(path_arg()))
		.subcommand(Command::new("untracked").about("List untracked local elements").arg(path_arg()))
		.subcommand(
			Command::new("open")
				.about("Keep random access files synchronized while editing")
				.arg(Arg::new("paths").required(true).action(ArgAction::Append).num_args(1..))
				.arg(
					Arg::new("iterations")
						.long("iterations")
						.value_parser(clap::value_parser!(u64))
						.help("Stop after this many iterations"),
				),
		)
		.subcommand(Command::new("system").about("Show server information"))
		.subcommand(Command::new("counters").about("Show server counters"))
		.get_matches();

	init_tracing(matches.get_flag("verbose"));
	let config = build_config(&matches)?;

	let (command, sub) = matches.subcommand().ok_or("command required")?;
	if command == "init" {
		return init(&config).await;
	}

	let manager = StateManager::new(&config.state_dir);
	let _lock = manager.lock().await?;
	let state = manager.load().await?.ok_or("not initialized, run `zyn init` first")?;
	let connection = connect(&config, &state.address, state.port, &state.username).await?;
	let mut client = ZynClient::new(connection, state);

	let check = client.validate_remote_matches_expected().await?;
	if !check.matches() {
		if !matches.get_flag("accept-new-server") {
			return Err(format!(
				"server changed (id {}, started at {}), rerun with --accept-new-server",
				check.actual.server_id, check.actual.started_at
			)
			.into());
		}
		warn!("Connected to a new server instance, running initial synchronization");
		for created in client.initial_synchronization().await? {
			println!("created  {}", created);
		}
		client.update_remote_info().await?;
		manager.save(client.state()).await?;
	}

	let result = run(&mut client, command, sub, &config).await;
	manager.save(client.state()).await?;
	if let Err(e) = client.connection().disconnect().await {
		warn!("Disconnect failed: {}", e);
	}
	result
}

// vim: ts=4
